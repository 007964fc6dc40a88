use std::time::Duration;

use async_trait::async_trait;

/// Source of delays for the client's poll loop, injected so tests can control time.
#[async_trait]
pub trait Timer: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}
