use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flags::flag_models::{FlagSet, FlagsResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventKind {
    Snapshot,
    Update,
    Heartbeat,
    Error,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::Snapshot => "snapshot",
            StreamEventKind::Update => "update",
            StreamEventKind::Heartbeat => "heartbeat",
            StreamEventKind::Error => "error",
        }
    }
}

/// One message on a flag subscription. `snapshot` and `update` carry the full flag set,
/// `error` carries a retry hint in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<FlagSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl StreamEvent {
    fn bare(kind: StreamEventKind) -> Self {
        Self {
            kind,
            flags: None,
            fingerprint: None,
            computed_at: None,
            retry_after: None,
        }
    }

    fn with_response(kind: StreamEventKind, response: FlagsResponse) -> Self {
        Self {
            kind,
            flags: Some(response.flags),
            fingerprint: Some(response.fingerprint),
            computed_at: Some(response.computed_at),
            retry_after: None,
        }
    }

    pub fn snapshot(response: FlagsResponse) -> Self {
        Self::with_response(StreamEventKind::Snapshot, response)
    }

    pub fn update(response: FlagsResponse) -> Self {
        Self::with_response(StreamEventKind::Update, response)
    }

    pub fn heartbeat() -> Self {
        Self::bare(StreamEventKind::Heartbeat)
    }

    pub fn error(retry_after: Duration) -> Self {
        Self {
            retry_after: Some(retry_after.as_secs()),
            ..Self::bare(StreamEventKind::Error)
        }
    }

    /// Snapshot or update.
    pub fn carries_flags(&self) -> bool {
        matches!(
            self.kind,
            StreamEventKind::Snapshot | StreamEventKind::Update
        )
    }

    /// The flag payload, when the event has a complete one.
    pub fn to_response(&self) -> Option<FlagsResponse> {
        match (&self.flags, &self.fingerprint, self.computed_at) {
            (Some(flags), Some(fingerprint), Some(computed_at)) => Some(FlagsResponse {
                flags: flags.clone(),
                fingerprint: fingerprint.clone(),
                computed_at,
            }),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_secs)
    }
}
