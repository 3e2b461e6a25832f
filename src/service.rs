use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::{
    error::RateLimitError,
    metrics::Metrics,
    result::RateLimitResult,
    tiered::{most_restrictive, TieredRateLimiter},
};

/// Header identifying the caller for the enforcement middleware
pub const CLIENT_KEY_HEADER: &str = "x-client-id";

/// Key used when a request carries no client header
pub const FALLBACK_KEY: &str = "global";

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<TieredRateLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(limiter: TieredRateLimiter, metrics: Arc<Metrics>) -> Self {
        Self {
            limiter: Arc::new(limiter),
            metrics,
        }
    }
}

/// Routes for health, metrics and explicit limit operations
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/limits/:key", post(enforce_key).delete(reset_key))
        .route("/v1/limits/:key/check", post(check_key))
        .with_state(state)
}

/// Middleware enforcing the limiter before the wrapped handler runs.
///
/// Install with `axum::middleware::from_fn_with_state(state, enforce_middleware)`.
pub async fn enforce_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let key = client_key(request.headers());
    match state.limiter.async_enforce(&key).await {
        Ok(results) => {
            let mut response = next.run(request).await;
            if let Some(result) = most_restrictive(&results) {
                response.headers_mut().extend(result.header_map());
            }
            response
        }
        Err(e) => e.into_response(),
    }
}

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get(CLIENT_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or(FALLBACK_KEY)
        .to_string()
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    let limiter = state.limiter.clone();
    let outcome = tokio::task::spawn_blocking(move || limiter.health_check())
        .await
        .map_err(|e| RateLimitError::BackendUnavailable(format!("health check worker failed: {}", e)))
        .and_then(|result| result);

    match outcome {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn enforce_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, RateLimitError> {
    let results = state.limiter.async_enforce(&key).await?;
    Ok(results_response(StatusCode::OK, &results))
}

async fn check_key(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let results = state.limiter.async_check(&key).await;
    let status = if results.iter().all(|r| r.allowed) {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    results_response(status, &results)
}

async fn reset_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, RateLimitError> {
    let limiter = state.limiter.clone();
    tokio::task::spawn_blocking(move || limiter.reset(&key))
        .await
        .map_err(|e| RateLimitError::BackendUnavailable(format!("reset worker failed: {}", e)))??;
    Ok(StatusCode::NO_CONTENT)
}

fn results_response(status: StatusCode, results: &[RateLimitResult]) -> Response {
    let body = json!({
        "allowed": results.iter().all(|r| r.allowed),
        "tiers": results.iter().map(result_json).collect::<Vec<_>>(),
    });
    let mut response = (status, Json(body)).into_response();
    if let Some(result) = most_restrictive(results) {
        response.headers_mut().extend(result.header_map());
    }
    response
}

fn result_json(result: &RateLimitResult) -> serde_json::Value {
    json!({
        "allowed": result.allowed,
        "key": result.key,
        "remaining": result.remaining,
        "limit": result.limit,
        "reset_at": result.reset_at.to_rfc3339(),
        "retry_after": result.retry_after.as_secs_f64(),
        "strategy": result.strategy,
    })
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match self {
            RateLimitError::Exceeded(exceeded) => {
                let body = json!({
                    "error": exceeded.to_string(),
                    "retry_after": exceeded.retry_after.as_secs_f64(),
                    "limit": exceeded.limit,
                    "strategy": exceeded.strategy,
                    "tier": exceeded.tier,
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response.headers_mut().extend(exceeded.result.header_map());
                response
            }
            RateLimitError::Config(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
            }
            other => {
                warn!("Rate limit backend error: {}", other);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "error": other.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::RateLimitConfig,
        limiter::RateLimiter,
        store::{CriticalSection, StorageBackend, StoreValue},
        strategy::StrategyKind,
    };
    use std::time::Duration;
    use axum::{body::Body, http::Request as HttpRequest, middleware, routing::get};
    use tower::ServiceExt;

    fn test_state(limit: u64) -> AppState {
        let limiter = RateLimitConfig::single(limit, 60.0, StrategyKind::FixedWindow)
            .build_with(Arc::new(ManualClock::new()), None)
            .unwrap();
        AppState::new(limiter, Arc::new(Metrics::new().unwrap()))
    }

    fn post(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_enforce_endpoint_returns_429_with_headers() {
        let app = router(test_state(1));

        let response = app.clone().oneshot(post("/v1/limits/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

        let response = app.oneshot(post("/v1/limits/alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1");
        assert!(response.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_reset_endpoint() {
        let app = router(test_state(1));
        app.clone().oneshot(post("/v1/limits/bob")).await.unwrap();

        let reset = HttpRequest::builder()
            .method("DELETE")
            .uri("/v1/limits/bob")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(reset).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(post("/v1/limits/bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let app = router(test_state(1));
        let request = HttpRequest::builder()
            .uri("/healthcheck")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Backend whose health check fails, like a Redis server that went away
    struct DownStore;

    impl StorageBackend for DownStore {
        fn get(&self, _key: &str) -> crate::error::Result<Option<StoreValue>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: StoreValue, _ttl: Option<Duration>) -> crate::error::Result<()> {
            Ok(())
        }
        fn delete(&self, _key: &str) -> crate::error::Result<()> {
            Ok(())
        }
        fn incr(&self, _key: &str, _ttl: Option<Duration>) -> crate::error::Result<i64> {
            Ok(1)
        }
        fn lock(&self, _key: &str) -> crate::error::Result<CriticalSection<'_>> {
            Ok(CriticalSection::new(()))
        }
        fn health_check(&self) -> crate::error::Result<()> {
            Err(RateLimitError::BackendUnavailable("PING timed out".into()))
        }
    }

    #[tokio::test]
    async fn test_healthcheck_reports_backend_down() {
        let limiter = RateLimiter::builder()
            .store(Arc::new(DownStore))
            .build()
            .unwrap();
        let state = AppState::new(
            TieredRateLimiter::new(vec![limiter]).unwrap(),
            Arc::new(Metrics::new().unwrap()),
        );

        let request = HttpRequest::builder()
            .uri("/healthcheck")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_middleware_keys_by_client_header() {
        let state = test_state(1);
        let app = Router::new()
            .route("/work", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(state, enforce_middleware));

        let request = |client: &str| {
            HttpRequest::builder()
                .uri("/work")
                .header(CLIENT_KEY_HEADER, client)
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(request("a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");

        let response = app.clone().oneshot(request("a")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.oneshot(request("b")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
