pub mod api;
pub mod client;
pub mod config;
pub mod database;
pub mod flags;
pub mod metrics;
pub mod router;
pub mod server;
pub mod sse;

// Used by the integration tests as well, so it can't be cfg(test)
pub mod test_utils;
