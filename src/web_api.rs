//! Web API Server
//!
//! HTTP control surface for a running cascade (feature `web-api`).
//!
//! ## Endpoints
//!
//! - `POST /api/v1/solve`: Run a query through the cascade (JSON)
//! - `POST /api/v1/cache/reset`: Invalidate every cached outcome
//! - `GET  /api/v1/stats`: Statistics and cache snapshot
//! - `GET  /health`: Health check
//! - `GET  /metrics`: Prometheus metrics

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::CacheSnapshot;
use crate::config::ServerSection;
use crate::stats::StatsSnapshot;
use crate::{CascadeError, CascadeOrchestrator, CascadeReport, Query, TierId};

// ============================================================================
// Types & Configuration
// ============================================================================

/// Configuration for the web API HTTP server.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address or hostname to bind to (e.g. `"0.0.0.0"` for all interfaces).
    pub host: String,
    /// TCP port the server listens on.
    pub port: u16,
    /// Maximum allowed request body size in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSection::default())
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
            max_request_size: section.max_request_size,
        }
    }
}

/// JSON body for `POST /api/v1/solve`.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveRequest {
    /// The raw query text.
    pub query: String,
    /// Optional starting tier (`symbolic`, `computational`, `reasoning`).
    #[serde(default)]
    pub tier: Option<String>,
}

/// JSON response body for `GET /api/v1/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    /// Cascade statistics.
    pub stats: StatsSnapshot,
    /// Cache figures.
    pub cache: CacheSnapshot,
    /// Computations currently running.
    pub inflight: usize,
}

// ============================================================================
// Server
// ============================================================================

/// Build the router serving `orchestrator`.
///
/// Exposed separately from [`start_server`] so callers can bind their own
/// listener.
pub fn router(orchestrator: CascadeOrchestrator, max_request_size: usize) -> Router {
    Router::new()
        .route("/api/v1/solve", post(solve_handler))
        .route("/api/v1/cache/reset", post(reset_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

/// Start the web API server.
///
/// Binds to `config.host:config.port` and serves until the server shuts
/// down.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    config: ServerConfig,
    orchestrator: CascadeOrchestrator,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);

    info!("Starting web API server on http://{}", addr);

    let app = router(orchestrator, config.max_request_size);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Web API ready on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds a unique `X-Request-ID` header to every response.
///
/// If the client sends an `X-Request-ID` header, it is preserved; otherwise
/// a new UUID v4 is generated.
///
/// # Panics
///
/// This function never panics.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
///
/// # Panics
///
/// This function never panics.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"error": "Request body too large"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /api/v1/solve`: Run the cascade and return the full report.
///
/// # Panics
///
/// This function never panics.
async fn solve_handler(
    State(orchestrator): State<CascadeOrchestrator>,
    Json(req): Json<SolveRequest>,
) -> Result<Json<CascadeReport>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".into()));
    }

    let mut query = Query::new(req.query);
    if let Some(tier) = req.tier.as_deref() {
        let tier: TierId = tier
            .parse()
            .map_err(|e: crate::ParseTierError| AppError::BadRequest(e.to_string()))?;
        query = query.with_tier(tier);
    }

    let report = orchestrator.submit(query).await?;
    Ok(Json(report))
}

/// `POST /api/v1/cache/reset`: Invalidate both cache levels.
///
/// # Panics
///
/// This function never panics.
async fn reset_handler(State(orchestrator): State<CascadeOrchestrator>) -> Json<serde_json::Value> {
    orchestrator.invalidate_cache().await;
    info!("cache reset via API");
    Json(serde_json::json!({"status": "reset"}))
}

/// `GET /api/v1/stats`: Statistics snapshot.
///
/// # Panics
///
/// This function never panics.
async fn stats_handler(State(orchestrator): State<CascadeOrchestrator>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: orchestrator.stats(),
        cache: orchestrator.cache().snapshot(),
        inflight: orchestrator.inflight_len(),
    })
}

/// `GET /health`: Health check endpoint.
///
/// Reports `degraded` while the durable cache level is bypassed, along with
/// the computational tier's monthly budget when that tier is registered.
///
/// # Panics
///
/// This function never panics.
async fn health_handler(State(orchestrator): State<CascadeOrchestrator>) -> Json<serde_json::Value> {
    let degraded = orchestrator.cache().is_degraded();
    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "tiers": orchestrator.registered_tiers(),
        "computational_budget": orchestrator.usage(),
    }))
}

/// `GET /metrics`: Prometheus metrics endpoint.
///
/// # Panics
///
/// This function never panics.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers.
///
/// Each variant maps to an HTTP status code and a JSON error body.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug)]
enum AppError {
    /// The request body was well-formed JSON but semantically invalid.
    BadRequest(String),
    /// The cascade aborted the request.
    Cascade(CascadeError),
}

impl From<CascadeError> for AppError {
    fn from(e: CascadeError) -> Self {
        AppError::Cascade(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Cascade(e) => {
                warn!(error = %e, "cascade aborted request");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================
