//! Client-facing stream routes: channel playlists, nested playlists,
//! relayed segments and keys.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::errors::{AppError, AppResult};
use crate::services::PlaylistResponse;
use crate::web::{
    AppState,
    responses::{handle_error, playlist},
};

/// `GET /stream/{channel}.m3u8`
pub async fn serve_stream(State(state): State<AppState>, Path(channel): Path<String>) -> Response {
    let channel_id = channel.strip_suffix(".m3u8").unwrap_or(&channel);
    debug!("Stream request for channel {}", channel_id);

    match state.stream_service.playlist(channel_id).await {
        Ok(PlaylistResponse::Playlist(body)) => playlist(body),
        Ok(PlaylistResponse::Redirect(location)) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Err(e) => handle_error(e),
    }
}

/// `GET /playlist/{token}`
pub async fn serve_nested_playlist(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    match state.stream_service.nested_playlist(&token).await {
        Ok(body) => playlist(body),
        Err(e) => handle_error(e),
    }
}

/// `GET /content/{token}`
pub async fn serve_content(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = match byte_range(&headers) {
        Ok(range) => range,
        Err(e) => return handle_error(e),
    };

    let content = match state.stream_service.stream_content(&token, range).await {
        Ok(content) => content,
        Err(e) => return handle_error(e),
    };

    let status = StatusCode::from_u16(content.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content.content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store");
    if let Some(length) = content.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    if let Some(range) = content.content_range {
        builder = builder
            .header(header::CONTENT_RANGE, range)
            .header(header::ACCEPT_RANGES, "bytes");
    }

    match builder.body(Body::from_stream(content.body)) {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build content response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Only single `bytes=` ranges are forwarded upstream
fn byte_range(headers: &HeaderMap) -> AppResult<Option<&str>> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let range = value
        .to_str()
        .map_err(|_| AppError::validation("Range header is not valid ASCII"))?;
    if !range.starts_with("bytes=") || range.contains(',') {
        return Err(AppError::validation(format!("Unsupported range: {range}")));
    }
    Ok(Some(range))
}

/// `GET /key/{token}/{refererToken}`
pub async fn serve_key(
    State(state): State<AppState>,
    Path((token, referer_token)): Path<(String, String)>,
) -> Response {
    match state.stream_service.fetch_key(&token, &referer_token).await {
        Ok(key) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CACHE_CONTROL, "no-cache, no-store"),
            ],
            key,
        )
            .into_response(),
        Err(e) => handle_error(e),
    }
}
