use std::future::ready;

use axum::{
    http::{Method, StatusCode},
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    api::{endpoint, sse_endpoint},
    config::Config,
    flags::flags_cache::FlagCache,
    metrics::utils::{setup_metrics_recorder, track_metrics},
    sse::stream_hub::StreamHub,
};

#[derive(Clone)]
pub struct State {
    pub flag_cache: FlagCache,
    pub stream_hub: StreamHub,
    // None when running against a non-Postgres store
    pub pool: Option<PgPool>,
    pub config: Config,
}

pub fn router(
    flag_cache: FlagCache,
    stream_hub: StreamHub,
    pool: Option<PgPool>,
    config: Config,
) -> Router {
    let readiness_pool = pool.clone();

    let state = State {
        flag_cache,
        stream_hub,
        pool,
        config: config.clone(),
    };

    // Very permissive CORS policy, browsers call this from arbitrary app origins.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::HEAD])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    // liveness/readiness checks
    let status_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || readiness(readiness_pool.clone())))
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route("/flags", get(endpoint::flags))
        .route("/flags/", get(endpoint::flags))
        .route("/flags/invalidate", post(endpoint::invalidate))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    // Streams are long lived, so they stay outside the concurrency limit
    let stream_router = Router::new().route("/flags/stream", get(sse_endpoint::flags_stream));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .merge(stream_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Global metrics recorders can play poorly with e.g. tests
    if config.enable_metrics {
        match setup_metrics_recorder() {
            Ok(recorder_handle) => {
                router.route("/metrics", get(move || ready(recorder_handle.render())))
            }
            Err(e) => {
                tracing::error!("Failed to install metrics recorder: {}", e);
                router
            }
        }
    } else {
        router
    }
}

pub async fn readiness(pool: Option<PgPool>) -> Result<&'static str, (StatusCode, String)> {
    if let Some(pool) = pool {
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("database unavailable: {e}"),
                )
            })?;
    }

    Ok("ready")
}

pub async fn index() -> &'static str {
    "flag delivery"
}
