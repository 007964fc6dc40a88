use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::database::PostgresOverrideStore;
use crate::flags::flag_source::{FlagSource, OverrideStore};
use crate::flags::flags_cache::FlagCache;
use crate::router;
use crate::sse::stream_hub::{StreamHub, StreamSettings};

// Expired entries are kept this many TTLs as fallback values before eviction
const STALE_RETENTION_TTLS: u32 = 10;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = match PostgresOverrideStore::new(&config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to create database pool: {}", e);
            return;
        }
    };
    let pool = store.pool().clone();

    serve_with_store(config, listener, Arc::new(store), Some(pool), shutdown).await
}

/// Runs the server against any override store. `pool`, when given, backs the readiness check.
pub async fn serve_with_store<F>(
    config: Config,
    listener: TcpListener,
    store: Arc<dyn OverrideStore>,
    pool: Option<PgPool>,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    let source = FlagSource::new(store, config.baseline_flags.iter().cloned());
    let flag_cache = FlagCache::new(source, config.cache_ttl(), config.in_flight_ttl());
    let stream_hub = StreamHub::new(flag_cache.clone(), StreamSettings::from(&config));

    let maintenance_cache = flag_cache.clone();
    let ttl = config.cache_ttl();
    let maintenance = tokio::spawn(async move {
        maintenance_cache
            .start_maintenance(ttl, ttl * STALE_RETENTION_TTLS)
            .await
    });

    let app = router::router(flag_cache, stream_hub.clone(), pool, config);

    // Open streams would otherwise hold graceful shutdown open forever
    let shutdown = async move {
        shutdown.await;
        stream_hub.shutdown();
    };

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on unknown address: {}", e),
    }

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        tracing::error!("Server error: {}", e);
    }

    maintenance.abort();
}
