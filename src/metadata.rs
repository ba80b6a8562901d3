//! Image metadata documents and their validation.
//!
//! Clients submit metadata as a JSON object alongside the image. Validation is
//! an explicit function that either returns a typed [`MetadataDraft`] or the
//! full list of problems found. The draft carries no timestamp: `createdAt` is
//! stamped by the ingestion orchestrator at the moment the document is
//! persisted, via [`MetadataDraft::stamp`].
//!
//! # Document shape
//!
//! ```text
//! {
//!   "filename":  "3f0c…e1.jpeg",              // server generated
//!   "createdAt": "2024-05-01T12:00:00.000Z",  // server stamped
//!   "authorId":  "uid-123",                   // from the bearer token
//!   "groupId":   "group-9",                   // optional, client supplied
//!   "caption":   "…"                          // extension fields
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum number of client extension fields.
pub const MAX_EXTENSION_FIELDS: usize = 32;

/// Maximum length of an extension field name.
pub const MAX_FIELD_NAME_LEN: usize = 64;

/// Maximum length of a group identifier.
pub const MAX_GROUP_ID_LEN: usize = 128;

/// Maximum size of the raw metadata JSON text in bytes.
pub const MAX_METADATA_BYTES: usize = 16 * 1024;

/// Fields owned by the server. Client-supplied values are discarded.
const SERVER_FIELDS: &[&str] = &["filename", "createdAt", "authorId"];

// =============================================================================
// Validation Errors
// =============================================================================

/// A single metadata validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// JSON field the error refers to (`metadata` for the document itself)
    pub field: String,

    /// Human-readable description
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// =============================================================================
// Documents
// =============================================================================

/// Validated metadata that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataDraft {
    pub filename: String,
    pub author_id: Option<String>,
    pub group_id: Option<String>,
    pub extra: Map<String, Value>,
}

impl MetadataDraft {
    /// Turn the draft into a persisted document stamped with `created_at`.
    pub fn stamp(self, created_at: DateTime<Utc>) -> ImageMetadata {
        ImageMetadata {
            filename: self.filename,
            created_at,
            author_id: self.author_id,
            group_id: self.group_id,
            extra: self.extra,
        }
    }
}

/// The metadata document stored for every image, keyed by `filename`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub filename: String,

    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,

    /// Client extension fields, flattened into the document
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A metadata document composed with its blob's public URL at read time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredImageRecord {
    pub filename: String,
    pub metadata: ImageMetadata,
    pub url: String,
}

// =============================================================================
// Validation
// =============================================================================

/// Validate raw metadata text and inject the server-owned fields.
///
/// An empty or whitespace-only `raw` is treated as `{}`.
pub fn validate_metadata_json(
    raw: &str,
    author_id: Option<&str>,
    filename: &str,
) -> Result<MetadataDraft, Vec<ValidationError>> {
    if raw.len() > MAX_METADATA_BYTES {
        return Err(vec![ValidationError::new(
            "metadata",
            format!("must be at most {} bytes", MAX_METADATA_BYTES),
        )]);
    }

    if raw.trim().is_empty() {
        return validate_metadata(&Value::Object(Map::new()), author_id, filename);
    }

    let value: Value = serde_json::from_str(raw)
        .map_err(|e| vec![ValidationError::new("metadata", format!("invalid JSON: {}", e))])?;

    validate_metadata(&value, author_id, filename)
}

/// Validate a parsed metadata value and inject the server-owned fields.
///
/// All problems are collected; the first one does not stop validation.
pub fn validate_metadata(
    raw: &Value,
    author_id: Option<&str>,
    filename: &str,
) -> Result<MetadataDraft, Vec<ValidationError>> {
    let Some(fields) = raw.as_object() else {
        return Err(vec![ValidationError::new(
            "metadata",
            "must be a JSON object",
        )]);
    };

    let mut errors = Vec::new();
    let mut group_id = None;
    let mut extra = Map::new();

    for (name, value) in fields {
        if SERVER_FIELDS.contains(&name.as_str()) {
            continue;
        }

        if name == "groupId" {
            match value {
                Value::Null => {}
                Value::String(s) if s.trim().is_empty() => {
                    errors.push(ValidationError::new("groupId", "must not be empty"));
                }
                Value::String(s) if s.len() > MAX_GROUP_ID_LEN => {
                    errors.push(ValidationError::new(
                        "groupId",
                        format!("must be at most {} characters", MAX_GROUP_ID_LEN),
                    ));
                }
                Value::String(s) => group_id = Some(s.clone()),
                _ => errors.push(ValidationError::new("groupId", "must be a string")),
            }
            continue;
        }

        if name.is_empty() || name.len() > MAX_FIELD_NAME_LEN {
            errors.push(ValidationError::new(
                name.clone(),
                format!("field names must be 1-{} characters", MAX_FIELD_NAME_LEN),
            ));
            continue;
        }

        extra.insert(name.clone(), value.clone());
    }

    if extra.len() > MAX_EXTENSION_FIELDS {
        errors.push(ValidationError::new(
            "metadata",
            format!("at most {} extension fields are allowed", MAX_EXTENSION_FIELDS),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(MetadataDraft {
        filename: filename.to_string(),
        author_id: author_id.map(str::to_string),
        group_id,
        extra,
    })
}

// =============================================================================
// Timestamp Format
// =============================================================================

/// `createdAt` as ISO-8601 UTC with millisecond precision (`…T12:00:00.000Z`).
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
