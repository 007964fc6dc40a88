pub mod stream_hub;
pub mod types;
