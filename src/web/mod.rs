//! Web layer module
//!
//! Thin axum handlers over [`StreamService`]. Client-facing routes serve
//! playlists and relayed bytes; `/api/v1` exposes resolution, service
//! toggling, sessions and cache administration.

use anyhow::Result;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::services::StreamService;

pub mod handlers;
pub mod middleware;
pub mod responses;

pub use responses::{ApiResponse, handle_error, handle_result};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub stream_service: Arc<StreamService>,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(stream_service: Arc<StreamService>) -> Self {
        Self {
            stream_service,
            start_time: chrono::Utc::now(),
        }
    }
}

/// Router with every route and middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/live", get(handlers::health::liveness_check))
        .route("/stream/{channel}", get(handlers::streams::serve_stream))
        .route(
            "/playlist/{token}",
            get(handlers::streams::serve_nested_playlist),
        )
        .route("/content/{token}", get(handlers::streams::serve_content))
        .route(
            "/key/{token}/{referer_token}",
            get(handlers::streams::serve_key),
        )
        .nest("/api/v1", api_v1_routes())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            middleware::request_logging_middleware,
        ))
        .with_state(state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/resolve/{channel}",
            get(handlers::api::resolve_channel),
        )
        .route("/services", get(handlers::api::list_services))
        .route(
            "/services/{name}/enable",
            post(handlers::api::enable_service),
        )
        .route(
            "/services/{name}/disable",
            post(handlers::api::disable_service),
        )
        .route("/sessions", get(handlers::api::list_sessions))
        .route("/cache", delete(handlers::api::clear_cache))
        .route(
            "/cache/{channel}",
            delete(handlers::api::invalidate_channel),
        )
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, stream_service: Arc<StreamService>) -> Result<Self> {
        let app = create_router(AppState::new(stream_service));
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self { app, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the token is cancelled, then stop accepting connections
    pub async fn serve_with_cancellation(self, cancellation_token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        tracing::info!("Web server listening on http://{}", self.addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                cancellation_token.cancelled().await;
                tracing::info!("Web server received cancellation signal, shutting down gracefully");
            })
            .await?;
        Ok(())
    }
}
