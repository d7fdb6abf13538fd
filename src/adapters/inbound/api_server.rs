//! Status API Server
//!
//! HTTP surface for liveness/readiness probes, aggregated governance stats
//! and a few operator actions (cache invalidation, pool resize and drain).
//! Operator routes under `/api/v1` are themselves rate limited per client.

use crate::application::{GovernorError, ResourceGovernor};
use crate::domain::PoolKind;
use crate::infrastructure::PoolError;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Header identifying the caller for rate limiting.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Bucket used when the caller sends no client id.
pub const ANONYMOUS_CLIENT: &str = "anonymous";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body of `POST /api/v1/cache/invalidate`; exactly one field must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct InvalidateRequest {
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Body of `POST /api/v1/pools/:kind/resize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResizeRequest {
    pub max_connections: usize,
}

/// API Server state.
#[derive(Clone)]
pub struct ApiState {
    pub governor: Arc<ResourceGovernor>,
}

impl ApiState {
    pub fn new(governor: Arc<ResourceGovernor>) -> Self {
        Self { governor }
    }
}

impl IntoResponse for GovernorError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.to_string() }));

        match &self {
            GovernorError::RateLimited(decision) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    axum::http::header::RETRY_AFTER,
                    HeaderValue::from(decision.retry_after_secs()),
                );
                headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
                (status, headers, body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}

/// Build the router with every route and layer.
pub fn router(state: ApiState) -> Router {
    let operator_routes = Router::new()
        .route("/api/v1/cache/invalidate", post(invalidate_handler))
        .route("/api/v1/pools/:kind/resize", post(resize_handler))
        .route("/api/v1/pools/:kind/drain", post(drain_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware));

    Router::new()
        // Liveness
        .route("/health", get(health_handler))
        // Readiness: all pools healthy
        .route("/ready", get(ready_handler))
        // Aggregated stats
        .route("/status", get(status_handler))
        .merge(operator_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status API server.
pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: String, governor: Arc<ResourceGovernor>) -> Self {
        Self {
            listen_addr,
            state: ApiState::new(governor),
        }
    }

    /// Serve until `shutdown` resolves, then finish in-flight requests.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run<S>(&self, shutdown: S) -> anyhow::Result<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("status API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("status API stopped");
        Ok(())
    }
}

fn client_id(headers: &HeaderMap) -> &str {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT)
}

async fn rate_limit_middleware(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_id(request.headers()).to_string();

    match state.governor.admit(&client).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            response
                .headers_mut()
                .insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
            response
        }
        Err(e) => e.into_response(),
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn parse_kind(raw: &str) -> Result<PoolKind, Response> {
    PoolKind::parse(raw)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("unknown pool kind: {}", raw)))
}

// Handler functions

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ready_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let health = state.governor.pools().health_status().await;
    let mut unhealthy: Vec<&str> = health
        .iter()
        .filter(|(_, s)| !s.healthy)
        .map(|(kind, _)| kind.as_str())
        .collect();
    unhealthy.sort_unstable();

    if unhealthy.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "ready": false,
                "unhealthy_pools": unhealthy
            })),
        )
    }
}

async fn status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.governor.status().await)
}

async fn invalidate_handler(
    State(state): State<ApiState>,
    Json(req): Json<InvalidateRequest>,
) -> Response {
    let cache = state.governor.cache();

    let removed = match (req.tag, req.pattern) {
        (Some(tag), None) => cache.invalidate_by_tag(&tag).await,
        (None, Some(pattern)) => match cache.invalidate_by_pattern(&pattern).await {
            Ok(n) => n,
            Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
        },
        _ => {
            return error_body(
                StatusCode::BAD_REQUEST,
                "exactly one of `tag` or `pattern` is required",
            )
        }
    };

    tracing::info!(removed, "cache invalidated via API");
    Json(serde_json::json!({ "removed": removed })).into_response()
}

async fn resize_handler(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    match state.governor.pools().resize(kind, req.max_connections).await {
        Ok(()) => Json(serde_json::json!({
            "pool": kind,
            "max_connections": req.max_connections
        }))
        .into_response(),
        Err(e @ PoolError::UnknownPool(_)) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ PoolError::InvalidConfig(_)) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => GovernorError::Pool(e).into_response(),
    }
}

async fn drain_handler(State(state): State<ApiState>, Path(kind): Path<String>) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let pools = state.governor.pools();
    if !pools.kinds().contains(&kind) {
        return error_body(StatusCode::NOT_FOUND, PoolError::UnknownPool(kind).to_string());
    }

    let reclaimed = pools.drain(kind).await;
    Json(serde_json::json!({
        "pool": kind,
        "reclaimed": reclaimed
    }))
    .into_response()
}
