use std::{env, net::SocketAddr, sync::Arc};

use crate::auth::{IdentityClient, UserIdentity};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use crate::stream;
use crate::usage::MeteringClient;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{Modify, OpenApi, ToSchema};
use vidgate_store::{Database, StorageError, UserStorageRecord};
use vidgate_stream::source::http::{HttpBlobConfig, HttpBlobSource};
use vidgate_stream::{BlobStore, DEFAULT_CHUNK_SIZE};

/// Hard cap on one multipart upload body.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let blob_config = HttpBlobConfig {
        timeout_secs: config.blob_timeout_secs,
        bearer_token: config.blob_token.clone(),
        ..HttpBlobConfig::default()
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(
        HttpBlobSource::new(config.blob_url.as_str(), blob_config)
            .context("initializing blob source")?,
    );

    let identity = IdentityClient::new(config.identity_url.as_str())?;
    let metering = match config.metering_url.as_deref() {
        Some(url) => Some(MeteringClient::new(url)?),
        None => {
            warn!("VIDGATE_METERING_URL not set; bandwidth checks and usage records disabled");
            None
        }
    };

    let state = Arc::new(AppState {
        db,
        blobs,
        identity,
        metering,
        chunk_size: config.chunk_size,
        default_quota_bytes: config.default_quota_bytes,
    });

    let app = build_router(state.clone())
        .layer(rate_limit_layer(RateLimitConfig::default()))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "vidgate-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stream/video/:filename", get(stream::stream_video))
        .route("/download/disk/:filename", get(stream::download_file))
        .route("/upload", post(upload))
        .route("/delete-file", delete(delete_file))
        .route("/storage-status", get(storage_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

pub(crate) struct AppState {
    pub(crate) db: Database,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) identity: IdentityClient,
    pub(crate) metering: Option<MeteringClient>,
    pub(crate) chunk_size: u64,
    pub(crate) default_quota_bytes: u64,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    identity_url: String,
    metering_url: Option<String>,
    blob_url: String,
    blob_token: Option<String>,
    blob_timeout_secs: u64,
    chunk_size: u64,
    default_quota_bytes: u64,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("VIDGATE_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid VIDGATE_API_ADDR")?;

        let db_url = env::var("VIDGATE_DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("VIDGATE_DB_URL or DATABASE_URL must be configured")?;

        let identity_url =
            env::var("VIDGATE_IDENTITY_URL").context("VIDGATE_IDENTITY_URL must be configured")?;

        let metering_url = env::var("VIDGATE_METERING_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let blob_url =
            env::var("VIDGATE_BLOB_URL").context("VIDGATE_BLOB_URL must be configured")?;

        let blob_token = env::var("VIDGATE_BLOB_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let blob_timeout_secs = env::var("VIDGATE_BLOB_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(30);

        let chunk_size = env::var("VIDGATE_STREAM_CHUNK_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE);

        let default_quota_bytes = env::var("VIDGATE_DEFAULT_QUOTA_MIB")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(mi_bytes)
            .unwrap_or_else(|| mi_bytes(50));

        Ok(Self {
            listen_addr,
            db_url,
            identity_url,
            metering_url,
            blob_url,
            blob_token,
            blob_timeout_secs,
            chunk_size,
            default_quota_bytes,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Vec<u8>, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 400, description = "Invalid multipart payload", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 403, description = "Storage or bandwidth quota exceeded", body = ErrorBody),
        (status = 409, description = "File already exists", body = ErrorBody),
        (status = 502, description = "Blob store unavailable", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let (user, token) = authenticate(&state, &headers).await?;

    let mut part: Option<(String, bytes::Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart payload: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            return Err(ApiError::bad_request("file part is missing a filename"));
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read file part: {err}")))?;
        part = Some((filename, bytes));
        break;
    }

    let Some((filename, bytes)) = part else {
        return Err(ApiError::bad_request("no file part in request"));
    };
    if filename.trim().is_empty() {
        return Err(ApiError::bad_request("no file selected"));
    }

    let size = bytes.len() as u64;
    let key = format!("{}/{}", user.username, filename);

    let storage = match state
        .db
        .find_user_storage(&user.email)
        .await
        .map_err(ApiError::internal)?
    {
        Some(storage) => storage,
        None => state
            .db
            .initialize_user_storage(&user.email, state.default_quota_bytes)
            .await
            .map_err(ApiError::internal)?,
    };

    if storage.files.iter().any(|file| file.filename == key) {
        return Err(ApiError::conflict(format!(
            "file '{filename}' already exists in the user's storage"
        )));
    }

    if storage.used_storage + size > storage.total_storage {
        return Err(ApiError::forbidden("upload exceeds storage quota"));
    }

    if let Some(metering) = &state.metering {
        if metering.check_upload_bandwidth(&token, size).await.is_none() {
            return Err(ApiError::forbidden("upload exceeds bandwidth quota"));
        }
    }

    state
        .blobs
        .put(&key, stream::content_type_for(&filename), bytes)
        .await?;

    state
        .db
        .add_file(&user.email, &key, size)
        .await
        .map_err(|err| match err.downcast::<StorageError>() {
            Ok(StorageError::DuplicateFile(name)) => {
                ApiError::conflict(format!("file '{name}' already exists"))
            }
            Ok(other) => ApiError::internal(other),
            Err(other) => ApiError::internal(other),
        })?;

    let mut alerts = None;
    if let Some(metering) = &state.metering {
        if metering.log_upload(&token, &key, size).await.is_none() {
            warn!(key = %key, size, "upload stored but usage record was not accepted");
        }
        alerts = metering.check_for_alerts(&token).await;
    }

    info!(key = %key, size, user = %user.email, "file uploaded");

    let used = storage.used_storage + size;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message: "File uploaded successfully".to_string(),
            filename: key,
            size,
            storage_percentage_used: percentage(used, storage.total_storage),
            alerts,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/delete-file",
    request_body = DeleteFileBody,
    responses(
        (status = 200, description = "File deleted", body = DeleteResponse),
        (status = 400, description = "Missing filename", body = ErrorBody),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody),
        (status = 404, description = "File not found", body = ErrorBody),
        (status = 502, description = "Blob store unavailable", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<DeleteFileBody>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let (user, token) = authenticate(&state, &headers).await?;

    let Some(filename) = payload.filename.filter(|name| !name.trim().is_empty()) else {
        return Err(ApiError::bad_request("filename is required"));
    };
    let key = format!("{}/{}", user.username, filename);

    let Some(record) = state
        .db
        .find_file(&user.email, &key)
        .await
        .map_err(ApiError::internal)?
    else {
        return Err(ApiError::not_found(format!(
            "file '{filename}' not found in user's storage"
        )));
    };

    // A key missing from the blob store is tolerated; the catalog row is
    // authoritative and must still be released.
    match state.blobs.delete(&key).await {
        Ok(()) | Err(vidgate_stream::StreamError::NotFound(_)) => {}
        Err(err) => return Err(ApiError::from(err)),
    }

    state
        .db
        .remove_file(&user.email, &key)
        .await
        .map_err(ApiError::internal)?;

    if let Some(metering) = &state.metering {
        if metering.log_deletion(&token, &key, record.size).await.is_none() {
            warn!(key = %key, "file deleted but usage record was not accepted");
        }
    }

    info!(key = %key, user = %user.email, "file deleted");
    Ok(Json(DeleteResponse {
        message: "File deleted successfully".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/storage-status",
    responses(
        (status = 200, description = "Current storage usage", body = StatusResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn storage_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ApiError> {
    let (user, _token) = authenticate(&state, &headers).await?;

    let storage = state
        .db
        .find_user_storage(&user.email)
        .await
        .map_err(ApiError::internal)?;

    let Some(storage) = storage else {
        return Ok(Json(StatusResponse {
            total_storage: state.default_quota_bytes,
            used_storage: 0,
            storage_percentage_used: 0.0,
            files: Vec::new(),
        }));
    };

    Ok(Json(StatusResponse::from(storage)))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(UserIdentity, String), ApiError> {
    let token = require_bearer(headers)?;
    let user = state
        .identity
        .validate_token(token)
        .await
        .ok_or_else(|| ApiError::unauthorized("invalid or expired token"))?;
    Ok((user, token.to_string()))
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    bearer_optional(headers)?
        .ok_or_else(|| ApiError::unauthorized("missing Authorization bearer token"))
}

fn bearer_optional(headers: &HeaderMap) -> Result<Option<&str>, ApiError> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let header_value = value
            .to_str()
            .map_err(|_| ApiError::unauthorized("invalid Authorization header encoding"))?;
        if let Some(token) = header_value.strip_prefix("Bearer ") {
            Ok(Some(token.trim()))
        } else {
            Err(ApiError::unauthorized(
                "Authorization header must be a Bearer token",
            ))
        }
    } else {
        Ok(None)
    }
}

fn percentage(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

#[derive(Debug, Deserialize, ToSchema)]
struct DeleteFileBody {
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct UploadResponse {
    message: String,
    filename: String,
    size: u64,
    storage_percentage_used: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    alerts: Option<Value>,
}

#[derive(Debug, Serialize, ToSchema)]
struct DeleteResponse {
    message: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct StatusResponse {
    total_storage: u64,
    used_storage: u64,
    storage_percentage_used: f64,
    files: Vec<FileStatusEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
struct FileStatusEntry {
    filename: String,
    size: u64,
}

impl From<UserStorageRecord> for StatusResponse {
    fn from(record: UserStorageRecord) -> Self {
        let storage_percentage_used = record.usage_percentage();
        Self {
            total_storage: record.total_storage,
            used_storage: record.used_storage,
            storage_percentage_used,
            files: record
                .files
                .into_iter()
                .map(|file| FileStatusEntry {
                    filename: file.filename,
                    size: file.size,
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
    content_range: Option<String>,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            content_range: None,
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub(crate) fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    /// A 416 carrying `Content-Range: bytes */<total>` so clients learn the
    /// real object size.
    pub(crate) fn range_not_satisfiable(message: impl Into<String>, total_size: u64) -> Self {
        let mut err = Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message);
        err.content_range = Some(format!("bytes */{total_size}"));
        err
    }
}

impl From<vidgate_stream::StreamError> for ApiError {
    fn from(err: vidgate_stream::StreamError) -> Self {
        use vidgate_stream::StreamError;

        let message = err.to_string();
        let status = match err {
            StreamError::MalformedRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            StreamError::BackendRead { .. }
            | StreamError::ShortRead { .. }
            | StreamError::Backend(_)
            | StreamError::RangeNotSupported => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        let mut response = (self.status, body).into_response();
        if let Some(content_range) = self.content_range {
            if let Ok(value) = HeaderValue::from_str(&content_range) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct ErrorBody {
    error: String,
}

fn mi_bytes(value: u64) -> u64 {
    value * 1024 * 1024
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{
        HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme,
    };

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Vidgate Gateway API", version = "0.1.0"),
        paths(
            healthz,
            crate::stream::stream_video,
            crate::stream::download_file,
            upload,
            delete_file,
            storage_status
        ),
        components(
            schemas(
                UploadResponse,
                DeleteFileBody,
                DeleteResponse,
                StatusResponse,
                FileStatusEntry,
                ErrorBody
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let components = openapi.components.get_or_insert_with(Default::default);
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("Token")
                        .description(Some(
                            "Bearer token validated against the identity service",
                        ))
                        .build(),
                ),
            );
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bytes::Bytes;
    use serde_json::{json, Value};
    use tower::Service;
    use vidgate_stream::source::memory::MemoryBlobSource;

    const GOOD_TOKEN: &str = "secret-token";

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn spawn_identity_stub() -> String {
        use axum::routing::get;

        async fn validate(headers: HeaderMap) -> Response {
            let authorized = headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(|value| value == format!("Bearer {GOOD_TOKEN}"))
                .unwrap_or(false);

            if authorized {
                Json(json!({ "username": "alice", "email": "alice@example.com" }))
                    .into_response()
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }

        let app = Router::new().route("/api/auth/validate", get(validate));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind identity stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("identity stub");
        });
        format!("http://{addr}")
    }

    async fn setup_test_app() -> (Arc<AppState>, Arc<MemoryBlobSource>, Router) {
        let identity_url = spawn_identity_stub().await;
        let db = Database::connect("sqlite::memory:").await.expect("db");
        let blobs = Arc::new(MemoryBlobSource::new());

        let state = Arc::new(AppState {
            db,
            blobs: blobs.clone(),
            identity: IdentityClient::new(identity_url).expect("identity client"),
            metering: None,
            chunk_size: 1024,
            default_quota_bytes: mi_bytes(50),
        });
        let router = build_router(state.clone());
        (state, blobs, router)
    }

    async fn seed_file(
        state: &AppState,
        blobs: &MemoryBlobSource,
        filename: &str,
        body: &[u8],
        quota: u64,
    ) {
        let key = format!("alice/{filename}");
        state
            .db
            .initialize_user_storage("alice@example.com", quota)
            .await
            .expect("init storage");
        state
            .db
            .add_file("alice@example.com", &key, body.len() as u64)
            .await
            .expect("catalog file");
        blobs.insert(&key, Bytes::copy_from_slice(body), Some("video/mp4"));
    }

    fn get_request(uri: &str, token: Option<&str>, range: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        if let Some(range) = range {
            builder = builder.header("range", range);
        }
        builder.body(Body::empty()).expect("request")
    }

    fn multipart_request(uri: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
        let boundary = "vidgate-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\ncontent-disposition: form-data; name=\"file\"; \
                 filename=\"{filename}\"\r\ncontent-type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {GOOD_TOKEN}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("multipart request")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes")
            .to_vec()
    }

    #[tokio::test]
    async fn stream_requires_valid_token() {
        let (_state, _blobs, mut router) = setup_test_app().await;

        let response = router
            .call(get_request("/stream/video/movie.mp4", None, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .call(get_request("/stream/video/movie.mp4", Some("wrong"), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn full_stream_returns_entire_object() {
        let (state, blobs, mut router) = setup_test_app().await;
        let body = pattern(5000);
        seed_file(&state, &blobs, "movie.mp4", &body, mi_bytes(50)).await;

        let response = router
            .call(get_request("/stream/video/movie.mp4", Some(GOOD_TOKEN), None))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "5000"
        );
        assert_eq!(
            response.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test]
    async fn range_stream_returns_partial_content() {
        let (state, blobs, mut router) = setup_test_app().await;
        let body = pattern(5000);
        seed_file(&state, &blobs, "movie.mp4", &body, mi_bytes(50)).await;

        let response = router
            .call(get_request(
                "/stream/video/movie.mp4",
                Some(GOOD_TOKEN),
                Some("bytes=0-0"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 0-0/5000"
        );
        assert_eq!(body_bytes(response).await, &body[0..1]);

        // End clamped to the last byte of the object.
        let response = router
            .call(get_request(
                "/stream/video/movie.mp4",
                Some(GOOD_TOKEN),
                Some("bytes=4990-9999"),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes 4990-4999/5000"
        );
        assert_eq!(body_bytes(response).await, &body[4990..5000]);
    }

    #[tokio::test]
    async fn malformed_range_is_a_hard_416() {
        let (state, blobs, mut router) = setup_test_app().await;
        let body = pattern(5000);
        seed_file(&state, &blobs, "movie.mp4", &body, mi_bytes(50)).await;

        for range in ["bytes=5000-", "bytes=abc-", "bytes=-500", "bytes=9-3"] {
            let response = router
                .call(get_request(
                    "/stream/video/movie.mp4",
                    Some(GOOD_TOKEN),
                    Some(range),
                ))
                .await
                .expect("response");
            assert_eq!(
                response.status(),
                StatusCode::RANGE_NOT_SATISFIABLE,
                "range '{range}' must be rejected"
            );
            assert_eq!(
                response.headers().get(header::CONTENT_RANGE).unwrap(),
                "bytes */5000"
            );
        }
    }

    #[tokio::test]
    async fn stream_of_unknown_file_is_404() {
        let (state, blobs, mut router) = setup_test_app().await;
        seed_file(&state, &blobs, "movie.mp4", &pattern(100), mi_bytes(50)).await;

        let response = router
            .call(get_request("/stream/video/ghost.mp4", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_sets_attachment_disposition() {
        let (state, blobs, mut router) = setup_test_app().await;
        let body = pattern(2048);
        seed_file(&state, &blobs, "report.pdf", &body, mi_bytes(50)).await;

        let response = router
            .call(get_request(
                "/download/disk/report.pdf",
                Some(GOOD_TOKEN),
                None,
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("attachment"));
        assert!(disposition.contains("report.pdf"));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/pdf"
        );
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test]
    async fn upload_then_status_reflects_usage() {
        let (_state, _blobs, mut router) = setup_test_app().await;
        let body = pattern(4096);

        let response = router
            .call(multipart_request("/upload", "clip.mp4", &body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let upload_json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(upload_json["filename"], "alice/clip.mp4");
        assert_eq!(upload_json["size"], 4096);

        let response = router
            .call(get_request("/storage-status", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let status_json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status_json["used_storage"], 4096);
        assert_eq!(status_json["files"][0]["filename"], "alice/clip.mp4");

        // The uploaded object must be immediately streamable.
        let response = router
            .call(get_request("/stream/video/clip.mp4", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, body);
    }

    #[tokio::test]
    async fn duplicate_upload_is_a_conflict() {
        let (_state, _blobs, mut router) = setup_test_app().await;
        let body = pattern(128);

        let response = router
            .call(multipart_request("/upload", "clip.mp4", &body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .call(multipart_request("/upload", "clip.mp4", &body))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn upload_beyond_quota_is_forbidden() {
        let (state, _blobs, mut router) = setup_test_app().await;
        state
            .db
            .initialize_user_storage("alice@example.com", 100)
            .await
            .expect("init storage");

        let response = router
            .call(multipart_request("/upload", "big.mp4", &pattern(5000)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn upload_without_file_part_is_rejected() {
        let (_state, _blobs, mut router) = setup_test_app().await;
        let boundary = "vidgate-test-boundary";
        let body = format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{boundary}--\r\n"
        );

        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header("authorization", format!("Bearer {GOOD_TOKEN}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .expect("request");

        let response = router.call(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_releases_quota_and_second_delete_is_404() {
        let (state, blobs, mut router) = setup_test_app().await;
        seed_file(&state, &blobs, "movie.mp4", &pattern(500), mi_bytes(50)).await;

        let delete_request = || {
            Request::builder()
                .method("DELETE")
                .uri("/delete-file")
                .header("authorization", format!("Bearer {GOOD_TOKEN}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&json!({ "filename": "movie.mp4" })).unwrap(),
                ))
                .expect("delete request")
        };

        let response = router.call(delete_request()).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .call(get_request("/storage-status", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        let status_json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status_json["used_storage"], 0);
        assert_eq!(status_json["files"].as_array().unwrap().len(), 0);

        let response = router.call(delete_request()).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn storage_status_for_new_user_reports_defaults() {
        let (state, _blobs, mut router) = setup_test_app().await;

        let response = router
            .call(get_request("/storage-status", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let status_json: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status_json["total_storage"], state.default_quota_bytes);
        assert_eq!(status_json["used_storage"], 0);
        assert_eq!(status_json["storage_percentage_used"], 0.0);
    }

    #[tokio::test]
    async fn backend_failure_mid_stream_aborts_the_body() {
        let (state, blobs, mut router) = setup_test_app().await;
        let body = pattern(10 * 1024);
        seed_file(&state, &blobs, "movie.mp4", &body, mi_bytes(50)).await;

        // Headers are already on the wire when the fifth chunk fails, so the
        // client must see a broken connection rather than a clean short body.
        blobs.fail_read_at(4096);

        let response = router
            .call(get_request("/stream/video/movie.mp4", Some(GOOD_TOKEN), None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let collected = to_bytes(response.into_body(), usize::MAX).await;
        assert!(collected.is_err(), "body must abort, not truncate cleanly");
    }

    #[test]
    fn openapi_document_declares_bearer_scheme() {
        let doc = docs::ApiDoc::openapi();
        let components = doc.components.as_ref().expect("components");
        assert!(components.security_schemes.contains_key("bearerAuth"));
        assert!(doc.to_yaml().expect("yaml").contains("bearerAuth"));
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let (_state, _blobs, mut router) = setup_test_app().await;
        let response = router
            .call(get_request("/healthz", None, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
