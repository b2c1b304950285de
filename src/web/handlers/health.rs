//! Health check HTTP handlers

use axum::{extract::State, response::Response};

use crate::utils::human_format::format_duration_secs;
use crate::web::{AppState, responses::ok};

/// Full health surface: sessions, cache statistics and per-service state
pub async fn health_check(State(state): State<AppState>) -> Response {
    ok(state.stream_service.health().await)
}

/// Liveness probe
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let uptime = (chrono::Utc::now() - state.start_time).num_seconds().max(0) as u64;
    let governor = state.stream_service.governor();
    ok(serde_json::json!({
        "status": if governor.is_closing() { "draining" } else { "alive" },
        "active_sessions": governor.active_count(),
        "uptime": format_duration_secs(uptime),
        "timestamp": chrono::Utc::now()
    }))
}
