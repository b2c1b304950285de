//! HTTP response types and utilities
//!
//! Standardized JSON envelopes for the admin API plus the mapping from
//! [`AppError`] to status codes used by every route.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::errors::{AdmissionError, AppError, AppResult, ResolveError};

/// Content type for HLS playlists
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Seconds a rejected client is asked to wait before retrying
pub const RETRY_AFTER_SECONDS: &str = "5";

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Status code and client-facing message for an error.
///
/// Internal details never reach the client; they are logged instead.
pub fn error_status(error: &AppError) -> (StatusCode, String) {
    match error {
        AppError::Resolve(ResolveError::UnknownChannel { channel_id }) => (
            StatusCode::NOT_FOUND,
            format!("channel '{}' not found", channel_id),
        ),
        AppError::Resolve(ResolveError::UnknownService { name }) => (
            StatusCode::NOT_FOUND,
            format!("service '{}' not found", name),
        ),
        AppError::Resolve(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "stream unavailable".to_string(),
        ),
        AppError::Token(_) => (StatusCode::FORBIDDEN, "invalid token".to_string()),
        AppError::Admission(AdmissionError::Rejected { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "too many active sessions".to_string(),
        ),
        AppError::Admission(AdmissionError::ShuttingDown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "server is shutting down".to_string(),
        ),
        AppError::Proxy(_) | AppError::Http(_) => {
            (StatusCode::BAD_GATEWAY, "upstream error".to_string())
        }
        AppError::NotFound { resource, id } => (
            StatusCode::NOT_FOUND,
            format!("{} '{}' not found", resource, id),
        ),
        AppError::Validation { message } => (StatusCode::BAD_REQUEST, message.clone()),
        AppError::Configuration { .. } | AppError::Internal { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        ),
    }
}

/// Convert AppError to appropriate HTTP response
pub fn handle_error(error: AppError) -> Response {
    let (status, message) = error_status(&error);
    if status.is_server_error() {
        error!("Request failed ({}): {}", status.as_u16(), error);
    } else {
        warn!("Request rejected ({}): {}", status.as_u16(), error);
    }

    let mut response = (status, Json(ApiResponse::<()>::error(message))).into_response();
    if matches!(error, AppError::Admission(_)) {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_static(RETRY_AFTER_SECONDS),
        );
    }
    response
}

/// Helper function to convert AppResult to HTTP response
pub fn handle_result<T>(result: AppResult<T>) -> Response
where
    T: Serialize,
{
    match result {
        Ok(data) => ok(data),
        Err(error) => handle_error(error),
    }
}

pub fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}

/// Playlist body with HLS content type; live playlists are never cached
pub fn playlist(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ProxyError, TokenError};
    use rstest::rstest;

    #[rstest]
    #[case(ResolveError::UnknownChannel { channel_id: "x".into() }.into(), StatusCode::NOT_FOUND)]
    #[case(ResolveError::UnknownService { name: "x".into() }.into(), StatusCode::NOT_FOUND)]
    #[case(ResolveError::NoServicesEnabled.into(), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(TokenError::Authentication.into(), StatusCode::FORBIDDEN)]
    #[case(AdmissionError::Rejected { active: 1, limit: 1 }.into(), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(ProxyError::Status { url: "u".into(), status: 404 }.into(), StatusCode::BAD_GATEWAY)]
    #[case(AppError::not_found("service", "x"), StatusCode::NOT_FOUND)]
    fn maps_errors_to_status(#[case] error: AppError, #[case] expected: StatusCode) {
        assert_eq!(error_status(&error).0, expected);
    }

    #[test]
    fn exhausted_resolution_hides_details() {
        let error: AppError = ResolveError::AllServicesExhausted {
            channel_id: "7".into(),
            attempts: 2,
            last_error: "secondary: HTTP 500 https://internal/".into(),
        }
        .into();
        let (_, message) = error_status(&error);
        assert_eq!(message, "stream unavailable");
    }

    #[test]
    fn admission_rejection_sets_retry_after() {
        let response = handle_error(AdmissionError::Rejected { active: 2, limit: 2 }.into());
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            RETRY_AFTER_SECONDS
        );
    }
}
