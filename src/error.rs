use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::metadata::ValidationError;

/// Errors returned by the object and metadata stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Object or document not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write refused because the key is already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The call did not answer before its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors produced by the quality-search encoder.
#[derive(Debug, Clone, Error)]
pub enum CompressionError {
    /// Intrinsic dimensions are unreadable or zero
    #[error("Invalid image: {message}")]
    InvalidImage { message: String },

    /// The compression target violates its own bounds
    #[error("Invalid compression target: {0}")]
    InvalidTarget(String),

    /// Pixel data could not be decoded
    #[error("Failed to decode image: {message}")]
    Decode { message: String },

    /// The codec failed to produce output
    #[error("Failed to encode image: {message}")]
    Encode { message: String },

    /// The blocking encoder task did not complete
    #[error("Encoder task failed: {0}")]
    Worker(String),
}

/// User-correctable request problems. Raised before any side effect.
#[derive(Debug, Clone, Error)]
pub enum ClientInputError {
    #[error("Invalid or missing image file: unsupported MIME type '{0}'")]
    InvalidMimeType(String),

    #[error("Invalid or missing image file")]
    MissingFile,

    #[error("Image file is empty")]
    EmptyFile,

    #[error("Invalid metadata: {}", join_validation_errors(.0))]
    InvalidMetadata(Vec<ValidationError>),

    #[error("Missing filename in request")]
    MissingFilename,

    #[error("Malformed multipart body: {0}")]
    Multipart(String),
}

fn join_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A detected cross-store inconsistency that needs out-of-band reconciliation.
///
/// Reported through logs and the inconsistency counter, never raised as a
/// user-facing failure of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InconsistencyWarning {
    /// A blob was written but its metadata was not, and compensation failed.
    OrphanBlob { filename: String, reason: String },

    /// Metadata remains for a blob that has been deleted.
    DanglingMetadata { filename: String, reason: String },
}

impl InconsistencyWarning {
    /// Short identifier used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            InconsistencyWarning::OrphanBlob { .. } => "orphan_blob",
            InconsistencyWarning::DanglingMetadata { .. } => "dangling_metadata",
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            InconsistencyWarning::OrphanBlob { filename, .. }
            | InconsistencyWarning::DanglingMetadata { filename, .. } => filename,
        }
    }
}

impl fmt::Display for InconsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconsistencyWarning::OrphanBlob { filename, reason } => {
                write!(f, "orphan blob '{}' left without metadata: {}", filename, reason)
            }
            InconsistencyWarning::DanglingMetadata { filename, reason } => write!(
                f,
                "metadata '{}' left referencing a deleted blob: {}",
                filename, reason
            ),
        }
    }
}

/// Errors surfaced by the ingestion and deletion orchestrators.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    ClientInput(#[from] ClientInputError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// A store call failed. Compensation has already been attempted.
    #[error("Failed to {operation} '{filename}': {source}")]
    UpstreamStore {
        operation: &'static str,
        filename: String,
        #[source]
        source: StoreError,
        inconsistency: Option<InconsistencyWarning>,
    },

    /// The detached persistence task panicked or was cancelled.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub(crate) fn upstream(
        operation: &'static str,
        filename: impl Into<String>,
        source: StoreError,
    ) -> Self {
        PipelineError::UpstreamStore {
            operation,
            filename: filename.into(),
            source,
            inconsistency: None,
        }
    }

    /// The inconsistency left behind by this failure, if any.
    pub fn inconsistency(&self) -> Option<&InconsistencyWarning> {
        match self {
            PipelineError::UpstreamStore { inconsistency, .. } => inconsistency.as_ref(),
            _ => None,
        }
    }
}
