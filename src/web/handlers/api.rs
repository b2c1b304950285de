//! Admin API under `/api/v1`

use axum::{
    extract::{Path, Query, State},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::web::{
    AppState,
    responses::{handle_result, ok},
};

#[derive(Debug, Serialize)]
pub struct CacheInvalidation {
    pub channel_id: Option<String>,
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    /// Run only this service, without failover or caching
    pub service: Option<String>,
}

/// `GET /api/v1/resolve/{channel}[?service=name]`
pub async fn resolve_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    Query(query): Query<ResolveQuery>,
) -> Response {
    let result = match query.service.as_deref() {
        Some(service) => {
            state
                .stream_service
                .resolve_with_service(&channel_id, service)
                .await
        }
        None => state.stream_service.resolve_stream(&channel_id).await,
    };
    handle_result(result)
}

/// `GET /api/v1/services`
pub async fn list_services(State(state): State<AppState>) -> Response {
    ok(state.stream_service.services())
}

/// `POST /api/v1/services/{name}/enable`
pub async fn enable_service(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    info!("Enabling service '{}'", name);
    handle_result(state.stream_service.set_service_enabled(&name, true))
}

/// `POST /api/v1/services/{name}/disable`
pub async fn disable_service(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    info!("Disabling service '{}'", name);
    handle_result(state.stream_service.set_service_enabled(&name, false))
}

/// `GET /api/v1/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Response {
    ok(state.stream_service.sessions())
}

/// `DELETE /api/v1/cache`
pub async fn clear_cache(State(state): State<AppState>) -> Response {
    let removed = state.stream_service.clear_cache().await;
    info!("Cleared {} cached stream(s)", removed);
    ok(CacheInvalidation {
        channel_id: None,
        removed,
    })
}

/// `DELETE /api/v1/cache/{channel}`
pub async fn invalidate_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
) -> Response {
    let removed = usize::from(state.stream_service.invalidate(&channel_id).await);
    ok(CacheInvalidation {
        channel_id: Some(channel_id),
        removed,
    })
}
