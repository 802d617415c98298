//! Admin HTTP API.
//!
//! Two endpoints, enough for operators to see what a running edge is
//! doing: `GET /` reports process facts and traffic counters, and
//! `GET /dump` returns the effective configuration (toml by default,
//! `?format=json` for json).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::proxy::{
    ListenerStats, ListenerStatsSnapshot, UdpRelayStats, UdpRelayStatsSnapshot,
};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    config: Config,
    started_at: DateTime<Utc>,
    tcp_stats: Arc<ListenerStats>,
    udp_stats: Option<Arc<UdpRelayStats>>,
}

impl AdminState {
    /// Create admin state for a process that just started.
    pub fn new(
        config: Config,
        tcp_stats: Arc<ListenerStats>,
        udp_stats: Option<Arc<UdpRelayStats>>,
    ) -> Self {
        Self {
            config,
            started_at: Utc::now(),
            tcp_stats,
            udp_stats,
        }
    }
}

/// Process status returned by `GET /`.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct StatusResponse {
    /// Process ID.
    pub pid: u32,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub time: String,

    /// Process start timestamp (ISO 8601).
    pub start_time: String,

    /// Seconds since start.
    pub uptime_secs: u64,

    /// TCP front-end counters.
    pub tcp: ListenerStatsSnapshot,

    /// UDP front-end counters, when the UDP relay is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpRelayStatsSnapshot>,
}

#[derive(Debug, Deserialize)]
struct DumpParams {
    #[serde(default = "default_dump_format")]
    format: String,
}

fn default_dump_format() -> String {
    "toml".to_string()
}

/// Create the admin router with all routes and middleware.
pub fn create_router(state: AdminState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/", get(status))
        .route("/dump", get(dump))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Process status and traffic counters.
async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let now = Utc::now();
    let uptime_secs = (now - state.started_at).num_seconds().max(0) as u64;

    Json(StatusResponse {
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        time: now.to_rfc3339(),
        start_time: state.started_at.to_rfc3339(),
        uptime_secs,
        tcp: state.tcp_stats.snapshot(),
        udp: state.udp_stats.as_ref().map(|stats| stats.snapshot()),
    })
}

/// Dump the effective configuration.
async fn dump(State(state): State<AdminState>, Query(params): Query<DumpParams>) -> Response {
    match params.format.as_str() {
        "json" => Json(&state.config).into_response(),
        "toml" => match toml::to_string_pretty(&state.config) {
            Ok(body) => ([(header::CONTENT_TYPE, "application/toml")], body).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("config serialization failed: {e}"),
            )
                .into_response(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown dump format: {other}"),
        )
            .into_response(),
    }
}
