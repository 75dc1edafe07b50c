//! HTTP/WebSocket API for the schedule server.
//!
//! Operators drive the schedule over REST; scoreboards, venue displays and
//! the public schedule page follow it over a WebSocket feed.
//!
//! # Modules
//!
//! - [`schedule`]: Bracket, placement, result and audit endpoints
//! - [`websocket`]: Filtered live feed with snapshot/replay catch-up
//! - [`request_id`]: Request correlation and HTTP metrics
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use md_server::api::{create_router, AppState};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! # let state: AppState = unimplemented!();
//! let app = create_router(state);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # CORS
//!
//! CORS is configured permissively; venue displays are served from
//! arbitrary hosts on the event network.

pub mod request_id;
pub mod schedule;
pub mod websocket;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use matchday::{
    ClashViolation, MutationLog, RealtimeHub, Registry, ScheduleHandle, TopicFilter,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Application state shared across all HTTP handlers and WebSocket connections.
///
/// Cloned for each request; every field is a handle.
#[derive(Clone)]
pub struct AppState {
    /// Sole path for schedule mutations
    pub engine: ScheduleHandle,
    /// Read side of the mutation log
    pub log: Arc<MutationLog>,
    pub hub: RealtimeHub,
    pub registry: Arc<dyn Registry>,
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Present when a placement was rejected for a competitor clash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clash: Option<ClashViolation>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            clash: None,
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn bad_request(error: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(error)))
}

/// Create the complete API router with all endpoints and middleware.
///
/// # Endpoint Summary
///
/// ```text
/// GET  /health                               - Health check
/// GET  /ws?client_id=&categories=&venues=&last_seq=
///                                            - Live feed
/// GET  /api/v1/categories                    - Registered categories
/// POST /api/v1/categories/{id}/bracket       - Build and commit a bracket
/// POST /api/v1/categories/{id}/withdraw      - Withdraw a competitor
/// POST /api/v1/schedule/run                  - Place every eligible match
/// GET  /api/v1/schedule                      - Current schedule, filterable
/// GET  /api/v1/schedule/deferred             - Matches waiting for a slot
/// GET  /api/v1/log?from=N&limit=M            - Audit history
/// GET  /api/v1/matches/{id}                  - One match
/// POST /api/v1/matches/{id}/place            - Engine placement
/// POST /api/v1/matches/{id}/manual-place     - Operator placement
/// POST /api/v1/matches/{id}/reschedule       - Move a placed match
/// POST /api/v1/matches/{id}/start            - Mark under way
/// POST /api/v1/matches/{id}/result           - Record the winner
/// POST /api/v1/matches/{id}/cancel           - Cancel
/// ```
pub fn create_router(state: AppState) -> Router {
    let v1_routes = create_v1_router();

    // Root routes (health check, WebSocket - not versioned)
    let root_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket::websocket_handler));

    Router::new()
        .merge(root_routes)
        .nest("/api/v1", v1_routes)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/categories", get(schedule::list_categories))
        .route("/categories/{category_id}/bracket", post(schedule::commit_bracket))
        .route("/categories/{category_id}/withdraw", post(schedule::withdraw))
        .route("/schedule", get(schedule::get_schedule))
        .route("/schedule/run", post(schedule::schedule_all))
        .route("/schedule/deferred", get(schedule::list_deferred))
        .route("/log", get(schedule::get_log))
        .route("/matches/{match_id}", get(schedule::get_match))
        .route("/matches/{match_id}/place", post(schedule::place_match))
        .route("/matches/{match_id}/manual-place", post(schedule::manual_place))
        .route("/matches/{match_id}/reschedule", post(schedule::reschedule))
        .route("/matches/{match_id}/start", post(schedule::start_match))
        .route("/matches/{match_id}/result", post(schedule::record_result))
        .route("/matches/{match_id}/cancel", post(schedule::cancel_match))
}

/// Health check endpoint for monitoring and load balancers.
///
/// Returns `200 OK` while the schedule engine is running, `503` otherwise.
///
/// ```bash
/// curl http://localhost:3000/health
/// # {"status":"healthy","engine":true,"log_seq":42,"clients":3,...}
/// ```
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine_healthy = !state.engine.is_closed();
    let log_seq = state.log.head_seq().await;
    let clients = state.hub.client_count().await;

    crate::metrics::log_head_seq(log_seq);
    crate::metrics::realtime_clients_active(clients);

    let status_code = if engine_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = json!({
        "status": if engine_healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "engine": engine_healthy,
        "log_seq": log_seq,
        "clients": clients,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (status_code, Json(response))
}

/// Parse a comma-separated id list such as `categories=1,4,7`
pub(crate) fn parse_id_list<T: FromStr + Ord>(
    name: &str,
    raw: Option<&str>,
) -> Result<Option<BTreeSet<T>>, String> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .map(|part| {
            part.parse()
                .map_err(|_| format!("Invalid {name} id: {part}"))
        })
        .collect::<Result<BTreeSet<T>, _>>()
        .map(Some)
}

/// Build a topic filter from query parameters
pub(crate) fn topic_filter(
    categories: Option<&str>,
    venues: Option<&str>,
) -> Result<TopicFilter, String> {
    Ok(TopicFilter {
        categories: parse_id_list("category", categories)?,
        venues: parse_id_list("venue", venues)?,
    })
}
