use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response status {0}")]
    Status(u16),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("stream closed by server")]
    StreamClosed,
    #[error("server reported an error (retry after {retry_after:?})")]
    Server { retry_after: Option<Duration> },
}

impl TransportError {
    /// How long the server asked clients to back off, if it said.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Server { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("payload is older than the applied flags")]
    StaleIgnored,
    #[error("snapshot store failed: {0}")]
    Snapshot(String),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Snapshot(e.to_string())
    }
}
