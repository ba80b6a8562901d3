//! HTTP request handlers for the image API.
//!
//! # Endpoints
//!
//! - `POST /images` - Upload an image with metadata
//! - `GET /images/{key}` - Public URL of a stored image
//! - `GET /images/{key}/record` - Metadata and URL of a stored image
//! - `DELETE /images/{filename}` - Delete an image and its metadata
//! - `GET /health` - Health check endpoint

use axum::{
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ClientInputError, CompressionError, PipelineError};
use crate::metadata::StoredImageRecord;
use crate::pipeline::{ImageService, RawImageInput, RecordLookup};
use crate::store::{MetadataStore, ObjectStore};

use super::auth::Principal;

/// Multipart field carrying the image bytes.
pub const CONTENT_FIELD: &str = "content";

/// Multipart field carrying the metadata JSON text.
pub const METADATA_FIELD: &str = "metadata";

// =============================================================================
// Application State
// =============================================================================

/// Shared application state containing the image service.
///
/// This is passed to all handlers via Axum's State extractor.
pub struct AppState<O: ObjectStore, M: MetadataStore> {
    pub service: ImageService<O, M>,
}

impl<O: ObjectStore + 'static, M: MetadataStore + 'static> AppState<O, M> {
    pub fn new(service: ImageService<O, M>) -> Self {
        Self { service }
    }
}

impl<O: ObjectStore, M: MetadataStore> Clone for AppState<O, M> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "invalid_metadata", "upstream_error")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// HTTP status code (included for convenience)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Cross-store inconsistencies detected since startup
    pub inconsistencies: u64,
}

/// Response from the delete endpoint.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub filename: String,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Convert PipelineError to HTTP response.
///
/// - 4xx errors are logged at WARN level (client errors)
/// - 5xx errors are logged at ERROR level (server errors)
impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            PipelineError::ClientInput(err) => {
                let error_type = match err {
                    ClientInputError::InvalidMimeType(_) => "invalid_mime_type",
                    ClientInputError::MissingFile => "missing_file",
                    ClientInputError::EmptyFile => "empty_file",
                    ClientInputError::InvalidMetadata(_) => "invalid_metadata",
                    ClientInputError::MissingFilename => "missing_filename",
                    ClientInputError::Multipart(_) => "invalid_multipart",
                };
                (StatusCode::BAD_REQUEST, error_type)
            }

            // A panicking encoder is our fault, not the upload's
            PipelineError::Compression(CompressionError::Worker(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            PipelineError::Compression(_) => (StatusCode::BAD_REQUEST, "invalid_image"),

            PipelineError::UpstreamStore { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "upstream_error")
            }
            PipelineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = self.to_string();

        if status.is_server_error() {
            error!(
                error_type = error_type,
                status = status.as_u16(),
                inconsistency = ?self.inconsistency().map(|w| w.kind()),
                "Server error: {}",
                message
            );
        } else {
            warn!(
                error_type = error_type,
                status = status.as_u16(),
                "Client error: {}",
                message
            );
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (status, Json(error_response)).into_response()
    }
}

fn error_response(status: StatusCode, error_type: &str, message: String) -> Response {
    let body = ErrorResponse::with_status(error_type, message, status);
    (status, Json(body)).into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// Handle image uploads.
///
/// # Endpoint
///
/// `POST /images` with a `multipart/form-data` body:
///
/// - `content`: the image file; its part `Content-Type` is the declared MIME type
/// - `metadata`: optional JSON object text
///
/// # Response
///
/// `201 Created` with the stored record:
/// ```json
/// {
///   "filename": "0b6c…e1.jpeg",
///   "metadata": { "filename": "0b6c…e1.jpeg", "createdAt": "…", "authorId": "…" },
///   "url": "https://bucket.s3.us-east-1.amazonaws.com/0b6c…e1.jpeg"
/// }
/// ```
///
/// # Errors
///
/// - `400 Bad Request`: missing/unsupported file, invalid metadata, undecodable image
/// - `500 Internal Server Error`: a store failed
pub async fn upload_handler<O, M>(
    State(state): State<AppState<O, M>>,
    principal: Option<Extension<Principal>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<StoredImageRecord>), PipelineError>
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    let multipart =
        multipart.map_err(|e| ClientInputError::Multipart(e.body_text()))?;
    let (input, raw_metadata) = read_upload(multipart).await?;
    let author_id = principal.as_ref().map(|Extension(p)| p.subject.as_str());

    debug!(
        mime_type = %input.mime_type,
        size = input.len(),
        author = ?author_id,
        "Received upload"
    );

    let record = state
        .service
        .ingest(input, raw_metadata.as_deref(), author_id)
        .await?;

    info!(filename = %record.filename, "Image ingested");
    Ok((StatusCode::CREATED, Json(record)))
}

/// Collect the `content` and `metadata` parts of an upload.
async fn read_upload(
    mut multipart: Multipart,
) -> Result<(RawImageInput, Option<String>), ClientInputError> {
    let mut content: Option<RawImageInput> = None;
    let mut metadata: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ClientInputError::Multipart(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(CONTENT_FIELD) => {
                let mime_type = field.content_type().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ClientInputError::Multipart(e.body_text()))?;
                content = Some(RawImageInput::new(data, mime_type));
            }
            Some(METADATA_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ClientInputError::Multipart(e.body_text()))?;
                metadata = Some(text);
            }
            other => {
                debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }

    let content = content.ok_or(ClientInputError::MissingFile)?;
    Ok((content, metadata))
}

/// Handle public URL lookups.
///
/// # Endpoint
///
/// `GET /images/{key}`
///
/// # Response
///
/// `200 OK` with the URL as a JSON string. The object's existence is not
/// checked; use the record endpoint for that.
pub async fn url_handler<O, M>(
    State(state): State<AppState<O, M>>,
    Path(key): Path<String>,
) -> Json<String>
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    Json(state.service.public_url(&key))
}

/// Handle stored record lookups.
///
/// # Endpoint
///
/// `GET /images/{key}/record`
///
/// # Errors
///
/// - `404 Not Found`: no metadata for this filename
/// - `410 Gone`: metadata exists but the image was deleted (`broken_link`)
/// - `500 Internal Server Error`: a store failed
pub async fn record_handler<O, M>(
    State(state): State<AppState<O, M>>,
    Path(key): Path<String>,
) -> Result<Response, PipelineError>
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    let response = match state.service.record(&key).await? {
        RecordLookup::Found(record) => Json(record).into_response(),
        RecordLookup::NotFound => {
            debug!(filename = %key, "Record not found");
            error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Image not found: {}", key),
            )
        }
        RecordLookup::BrokenLink(_) => {
            warn!(filename = %key, "Record references a missing image");
            error_response(
                StatusCode::GONE,
                "broken_link",
                format!("Image '{}' has metadata but its file is missing", key),
            )
        }
    };

    Ok(response)
}

/// Handle image deletion.
///
/// # Endpoint
///
/// `DELETE /images/{filename}`
///
/// Idempotent: deleting an absent image returns `200 OK`.
pub async fn delete_handler<O, M>(
    State(state): State<AppState<O, M>>,
    Path(filename): Path<String>,
) -> Result<Json<DeleteResponse>, PipelineError>
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    let outcome = state.service.delete(&filename).await?;

    Ok(Json(DeleteResponse {
        message: "Image deleted successfully".to_string(),
        filename: outcome.filename,
    }))
}

/// Handle health check requests.
///
/// # Endpoint
///
/// `GET /health`
///
/// # Response
///
/// ```json
/// { "status": "healthy", "version": "0.1.0", "inconsistencies": 0 }
/// ```
pub async fn health_handler<O, M>(State(state): State<AppState<O, M>>) -> Json<HealthResponse>
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        inconsistencies: state.service.inconsistency_count(),
    })
}

// =============================================================================
// Tests
// =============================================================================
