use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{debug_handler, Json};
use axum_client_ip::InsecureClientIp;
use bytes::Bytes;
use tracing::Instrument;

use crate::api::errors::FlagError;
use crate::api::types::{FlagsQueryParams, InvalidateRequest};
use crate::metrics::consts::{FLAG_NOT_MODIFIED_COUNTER, FLAG_REQUESTS_COUNTER};
use crate::metrics::utils::inc;
use crate::router;

/// Flags for an authenticated (user, organization) pair.
///
/// Responds `200 {flags, fingerprint, computedAt}` with the fingerprint as a strong ETag. When
/// the client already holds the current fingerprint (sent as `If-None-Match` or the
/// `fingerprint` query parameter) the response is `304` with no body. Source outages never
/// surface here: the cache answers with its best known value.
#[debug_handler]
pub async fn flags(
    State(state): State<router::State>,
    InsecureClientIp(ip): InsecureClientIp,
    Query(params): Query<FlagsQueryParams>,
    headers: HeaderMap,
) -> Result<Response, FlagError> {
    let (user_id, org_id) = params.identity()?;

    let span = tracing::debug_span!("flags_request", %user_id, %org_id, %ip);
    let cached = state
        .flag_cache
        .get_flags(&user_id, &org_id)
        .instrument(span)
        .await;

    let outcome = format!("{:?}", cached.outcome).to_lowercase();
    inc(
        FLAG_REQUESTS_COUNTER,
        &[("outcome".to_string(), outcome)],
        1,
    );

    let etag = HeaderValue::from_str(&format!("\"{}\"", cached.fingerprint))
        .map_err(|e| FlagError::Internal(format!("invalid etag: {e}")))?;

    let known = if_none_match(&headers).or(params.fingerprint);
    if known.as_deref() == Some(cached.fingerprint.as_str()) {
        inc(FLAG_NOT_MODIFIED_COUNTER, &[], 1);
        tracing::debug!(%user_id, %org_id, "Flags unchanged");
        return Ok((
            StatusCode::NOT_MODIFIED,
            [(ETAG, etag), (CACHE_CONTROL, HeaderValue::from_static("no-cache"))],
        )
            .into_response());
    }

    Ok((
        StatusCode::OK,
        [(ETAG, etag), (CACHE_CONTROL, HeaderValue::from_static("no-cache"))],
        Json(cached.to_response()),
    )
        .into_response())
}

/// Drops cached flags for a user, an organization, or both. An empty body clears everything.
pub async fn invalidate(
    State(state): State<router::State>,
    body: Bytes,
) -> Result<StatusCode, FlagError> {
    let request: InvalidateRequest = if body.iter().all(u8::is_ascii_whitespace) {
        InvalidateRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let removed = state
        .flag_cache
        .invalidate(request.user_id.as_deref(), request.org_id.as_deref());

    tracing::info!(
        user_id = ?request.user_id,
        org_id = ?request.org_id,
        removed,
        "Invalidated cached flags"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// First entity tag of an `If-None-Match` header, without quotes or weak prefix.
fn if_none_match(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(IF_NONE_MATCH)?.to_str().ok()?;
    raw.split(',')
        .map(str::trim)
        .map(|tag| tag.trim_start_matches("W/").trim_matches('"'))
        .find(|tag| !tag.is_empty() && *tag != "*")
        .map(str::to_string)
}
