//! Streaming and download handlers: range negotiation, chunked body, headers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use futures::TryStreamExt;
use tracing::info;
use vidgate_stream::{
    chunk_stream, negotiate_range, RangeWindow, StreamTarget, FALLBACK_CONTENT_TYPE,
};

use crate::auth::UserIdentity;
use crate::server::{authenticate, ApiError, AppState};

#[utoipa::path(
    get,
    path = "/stream/video/{filename}",
    params(("filename" = String, Path, description = "Name of the stored file")),
    responses(
        (status = 200, description = "Whole object"),
        (status = 206, description = "Requested byte range"),
        (status = 401, description = "Missing or invalid credentials", body = crate::server::ErrorBody),
        (status = 404, description = "File not found", body = crate::server::ErrorBody),
        (status = 416, description = "Unsatisfiable range", body = crate::server::ErrorBody),
        (status = 502, description = "Blob store unavailable", body = crate::server::ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn stream_video(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let (user, _token) = authenticate(&state, &headers).await?;
    let target = resolve_target(&state, &user, &filename).await?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    if target.total_size == 0 {
        if range_header.is_some() {
            return Err(ApiError::range_not_satisfiable(
                "cannot satisfy a range against an empty object",
                0,
            ));
        }
        return empty_response(&target, None);
    }

    let window = negotiate_range(range_header, target.total_size)
        .map_err(|err| ApiError::range_not_satisfiable(err.to_string(), target.total_size))?;

    info!(
        key = %target.key,
        start = window.start,
        end = window.end,
        partial = window.is_partial,
        "stream start"
    );

    chunked_response(&state, target, window, None)
}

#[utoipa::path(
    get,
    path = "/download/disk/{filename}",
    params(("filename" = String, Path, description = "Name of the stored file")),
    responses(
        (status = 200, description = "Whole object as attachment"),
        (status = 401, description = "Missing or invalid credentials", body = crate::server::ErrorBody),
        (status = 404, description = "File not found", body = crate::server::ErrorBody),
        (status = 502, description = "Blob store unavailable", body = crate::server::ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
pub(crate) async fn download_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let (user, _token) = authenticate(&state, &headers).await?;
    let target = resolve_target(&state, &user, &filename).await?;

    let disposition = format!("attachment; filename=\"{filename}\"");
    if target.total_size == 0 {
        return empty_response(&target, Some(disposition));
    }

    let window = RangeWindow::full(target.total_size);
    info!(key = %target.key, size = target.total_size, "download start");

    chunked_response(&state, target, window, Some(disposition))
}

/// Resolves a request's filename to a streamable object: the catalog must
/// list the key under the user, and the blob store must report its size.
async fn resolve_target(
    state: &AppState,
    user: &UserIdentity,
    filename: &str,
) -> Result<StreamTarget, ApiError> {
    let key = format!("{}/{}", user.username, filename);

    let storage = state
        .db
        .find_user_storage(&user.email)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("no storage record for user"))?;

    if !storage.files.iter().any(|file| file.filename == key) {
        return Err(ApiError::not_found(format!(
            "file '{filename}' not found in user's storage"
        )));
    }

    let meta = state.blobs.metadata(&key).await?;
    let content_type = content_type_for(filename)
        .map(str::to_string)
        .or(meta.content_type)
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

    Ok(StreamTarget::new(key, meta.size, content_type))
}

/// Builds the streaming response for a negotiated window: 206 with a
/// `Content-Range` for partial windows, plain 200 otherwise. The body pulls
/// one bounded chunk at a time; a client disconnect drops the stream and
/// stops backend reads.
fn chunked_response(
    state: &AppState,
    target: StreamTarget,
    window: RangeWindow,
    disposition: Option<String>,
) -> Result<Response, ApiError> {
    let chunks = chunk_stream(
        state.blobs.clone(),
        target.key.clone(),
        window,
        state.chunk_size,
    )
    .map_ok(|chunk| chunk.bytes);

    let status = if window.is_partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, target.content_type.as_str())
        .header(header::CONTENT_LENGTH, window.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache");

    if window.is_partial {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", window.start, window.end, target.total_size),
        );
    }
    if let Some(disposition) = disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    builder
        .body(Body::from_stream(chunks))
        .map_err(ApiError::internal)
}

fn empty_response(target: &StreamTarget, disposition: Option<String>) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, target.content_type.as_str())
        .header(header::CONTENT_LENGTH, 0)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(disposition) = disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }
    builder.body(Body::empty()).map_err(ApiError::internal)
}

/// Content type from the filename extension. Covers the media types the
/// gateway is built for plus a few common document formats; anything else
/// falls back to the blob store's reported type or the generic binary type.
pub(crate) fn content_type_for(filename: &str) -> Option<&'static str> {
    let ext = std::path::Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();

    let content_type = match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => return None,
    };
    Some(content_type)
}
