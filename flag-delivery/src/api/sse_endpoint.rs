use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use tracing::{error, info};

use crate::api::errors::FlagError;
use crate::api::types::FlagsQueryParams;
use crate::router::State as AppState;
use crate::sse::types::StreamEvent;

/// SSE endpoint for real-time flag updates.
///
/// Query parameters:
/// - `user_id`: authenticated user id (required)
/// - `org_id`: the user's organization id (required)
///
/// The stream opens with a `snapshot` of the current flags, then sends an `update` whenever
/// the flags for this user change, and a `heartbeat` at a fixed interval. If the server can't
/// produce flags it sends a single `error` carrying a retry hint and closes the stream.
/// Returns 503 when streaming is disabled so clients switch to polling.
///
/// Event format:
/// ```text
/// event: snapshot
/// data: {"kind":"snapshot","flags":{"core":true},"fingerprint":"5f1c...","computedAt":"2024-01-01T00:00:00Z"}
///
/// event: heartbeat
/// data: {"kind":"heartbeat"}
///
/// event: error
/// retry: 5000
/// data: {"kind":"error","retryAfter":5}
/// ```
pub async fn flags_stream(
    State(state): State<AppState>,
    Query(params): Query<FlagsQueryParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, FlagError> {
    if !*state.config.stream_enabled {
        return Err(FlagError::StreamDisabled);
    }

    let (user_id, org_id) = params.identity()?;

    let subscription = state.stream_hub.subscribe(&user_id, &org_id);
    info!(
        connection_id = subscription.id(),
        %user_id,
        %org_id,
        "New SSE connection"
    );

    let stream = subscription
        .into_stream()
        .map(|event| Ok(to_sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let mut sse = Event::default().event(event.kind.as_str());

    sse = match serde_json::to_string(event) {
        Ok(data) => sse.data(data),
        Err(e) => {
            error!("Failed to serialize stream event: {}", e);
            sse.data(format!(r#"{{"kind":"{}"}}"#, event.kind.as_str()))
        }
    };

    if let Some(retry) = event.retry_after() {
        sse = sse.retry(retry);
    }

    sse
}
