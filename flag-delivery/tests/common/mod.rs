use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::header::{CONTENT_TYPE, IF_NONE_MATCH};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use flag_delivery::config::Config;
use flag_delivery::database::InMemoryOverrideStore;
use flag_delivery::server::serve_with_store;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(Config::default_test_config);

pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: InMemoryOverrideStore,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn for_store(config: Config, store: InMemoryOverrideStore) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let server_store = Arc::new(store.clone());
        tokio::spawn(async move {
            serve_with_store(config, listener, server_store, None, async move {
                notify.notified().await
            })
            .await
        });
        ServerHandle {
            addr,
            store,
            shutdown,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub async fn get_flags(&self, user_id: &str, org_id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}/flags", self.addr))
            .query(&[("user_id", user_id), ("org_id", org_id)])
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get_flags_if_none_match(
        &self,
        user_id: &str,
        org_id: &str,
        fingerprint: &str,
    ) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}/flags", self.addr))
            .query(&[("user_id", user_id), ("org_id", org_id)])
            .header(IF_NONE_MATCH, format!("\"{fingerprint}\""))
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn send_invalidate<T: Into<reqwest::Body>>(&self, body: T) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{}/flags/invalidate", self.addr))
            .body(body)
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn open_stream(&self, user_id: &str, org_id: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}/flags/stream", self.addr))
            .query(&[("user_id", user_id), ("org_id", org_id)])
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
