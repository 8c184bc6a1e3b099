//! HTTP API over the cache coordinator.
//!
//! - GET /v1/artifacts/{key}  (read-through, loads misses from the source)
//! - PUT /v1/artifacts/{key}?ttl_secs=N
//! - DELETE /v1/artifacts/{key}
//! - GET /v1/cache/stats
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::cache::coordinator::{CacheCoordinator, CacheError, CacheStats};
use crate::cache::persistent::{DiskStats, PersistentTier};
use crate::clock::deadline_after;
use crate::metrics::PrometheusMetrics;
use crate::resilience::FetchError;
use crate::source::UpstreamError;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const CACHE_TIER_HEADER: HeaderName = HeaderName::from_static("x-cache-tier");

/// Application state shared across handlers.
pub struct AppState {
    pub cache: CacheCoordinator,
    pub metrics: Arc<PrometheusMetrics>,
    /// Kept for stats; the coordinator only sees it as a `CacheTier`.
    pub disk: Option<PersistentTier>,
    pub request_timeout: Duration,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let trace = TraceLayer::new_for_http().make_span_with(|req: &Request| {
        let request_id = req
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        info_span!("request", method = %req.method(), uri = %req.uri(), request_id = %request_id)
    });

    Router::new()
        .route(
            "/v1/artifacts/{*key}",
            get(get_artifact).put(put_artifact).delete(delete_artifact),
        )
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(trace)
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

/// Tag each request with an id, honoring one the client already sent.
async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = match req.headers().get(&REQUEST_ID_HEADER) {
        Some(existing) => existing.clone(),
        None => {
            let fresh = Uuid::new_v4().to_string();
            match HeaderValue::from_str(&fresh) {
                Ok(v) => v,
                Err(_) => return next.run(req).await,
            }
        }
    };
    req.headers_mut().insert(REQUEST_ID_HEADER, id.clone());
    let mut response = next.run(req).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, id);
    response
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PutParams {
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub disk: Option<DiskStats>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub breaker: Option<String>,
}

// ─── Error Mapping ─────────────────────────────────────────────────────────

/// A [`CacheError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CacheError);

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError(err)
    }
}

/// Status code and short machine-readable kind for an error.
pub fn classify(err: &CacheError) -> (StatusCode, &'static str) {
    match err {
        CacheError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "invalid_key"),
        CacheError::InvalidTtl => (StatusCode::BAD_REQUEST, "invalid_ttl"),
        CacheError::DeadlineExceeded { .. } => (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded"),
        CacheError::Fetch(FetchError::CircuitOpen(_)) => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
        CacheError::Fetch(FetchError::RateLimited(_)) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        CacheError::Fetch(FetchError::RetriesExhausted { .. }) => (StatusCode::BAD_GATEWAY, "retries_exhausted"),
        CacheError::Fetch(FetchError::Upstream(UpstreamError::NotFound(_))) => (StatusCode::NOT_FOUND, "not_found"),
        CacheError::Fetch(FetchError::Upstream(e)) if e.is_transient() => (StatusCode::BAD_GATEWAY, "upstream"),
        CacheError::Fetch(FetchError::Upstream(_)) => (StatusCode::UNPROCESSABLE_ENTITY, "upstream_rejected"),
        CacheError::NoFetcher | CacheError::LoadFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

fn retry_after(err: &CacheError) -> Option<Duration> {
    match err {
        CacheError::Fetch(FetchError::CircuitOpen(e)) => Some(e.retry_after),
        CacheError::Fetch(FetchError::RateLimited(e)) => Some(e.retry_after),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = classify(&self.0);
        let mut headers = HeaderMap::new();
        if let Some(wait) = retry_after(&self.0) {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: kind.to_string(),
        };
        (status, headers, Json(body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_artifact(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Result<Response, ApiError> {
    let deadline = deadline_after(state.request_timeout);
    let entry = state.cache.get_or_fetch_entry(&key, Some(deadline)).await?;
    info!(key = %key, tier = %entry.origin_tier, size = entry.value.len(), "Served artifact");

    let tier = HeaderValue::from_static(entry.origin_tier.as_str());
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CACHE_TIER_HEADER, tier),
        ],
        entry.value,
    )
        .into_response())
}

async fn put_artifact(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let ttl = params
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.cache.default_ttl());
    state.cache.put(&key, body, ttl).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_artifact(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Result<StatusCode, ApiError> {
    state.cache.invalidate(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cache: state.cache.stats(),
        disk: state.disk.as_ref().map(PersistentTier::stats),
    })
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let breaker = state.cache.fetcher().map(|f| f.breaker().state().to_string());
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        breaker,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitOpenError, RateLimitExceeded};

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (CacheError::InvalidKey("empty".into()), StatusCode::BAD_REQUEST),
            (CacheError::InvalidTtl, StatusCode::BAD_REQUEST),
            (CacheError::DeadlineExceeded { key: "k".into() }, StatusCode::GATEWAY_TIMEOUT),
            (
                CacheError::Fetch(FetchError::CircuitOpen(CircuitOpenError {
                    source_id: "s".into(),
                    retry_after: Duration::from_secs(3),
                })),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                CacheError::Fetch(FetchError::RateLimited(RateLimitExceeded {
                    source_id: "s".into(),
                    retry_after: Duration::from_millis(100),
                })),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                CacheError::Fetch(FetchError::RetriesExhausted {
                    attempts: 3,
                    last: UpstreamError::Connection("reset".into()),
                }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CacheError::Fetch(FetchError::Upstream(UpstreamError::NotFound("k".into()))),
                StatusCode::NOT_FOUND,
            ),
            (
                CacheError::Fetch(FetchError::Upstream(UpstreamError::Rejected {
                    status: 400,
                    message: "bad".into(),
                })),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(classify(&err).0, status, "{err}");
        }
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = ApiError(CacheError::Fetch(FetchError::RateLimited(RateLimitExceeded {
            source_id: "s".into(),
            retry_after: Duration::from_millis(1_200),
        })));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }
}
