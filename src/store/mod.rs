//! Storage collaborators.
//!
//! Images live in two independently failing stores:
//!
//! ```text
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │       ObjectStore        │      │      MetadataStore       │
//! │  key → compressed bytes  │      │  id → ImageMetadata      │
//! │  (S3 bucket / memory)    │      │  (JSON docs / memory)    │
//! └──────────────────────────┘      └──────────────────────────┘
//!              ▲          filename = key = id          ▲
//!              └──────────────────┬────────────────────┘
//!                                 │
//!                        pipeline::ImageService
//! ```
//!
//! There is no transaction spanning the two; the pipeline sequences calls and
//! compensates. Both traits require deletes to be idempotent: removing an
//! absent key or id succeeds.

mod memory;
mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::metadata::ImageMetadata;

pub use memory::{MemoryMetadataStore, MemoryObjectStore, StoredObject};
pub use s3::{create_s3_client, default_public_base_url, S3MetadataStore, S3ObjectStore};

// =============================================================================
// Object Store
// =============================================================================

/// A stored object as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub key: String,

    /// `None` when the backend does not report it.
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectSummary {
    /// Time since the last write, `None` when unknown or in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.last_modified
            .and_then(|modified| (now - modified).to_std().ok())
    }
}

/// Key-addressed binary storage with public URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` and return its public URL.
    ///
    /// With `disallow_overwrite`, an existing key fails with
    /// [`StoreError::AlreadyExists`] and leaves the stored object untouched.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        disallow_overwrite: bool,
    ) -> Result<String, StoreError>;

    /// Public URL for `key`. Does not check that the object exists.
    fn public_url(&self, key: &str) -> String;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Whether an object is stored under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Every stored object with its last write time.
    async fn list_objects(&self) -> Result<Vec<ObjectSummary>, StoreError>;

    /// Identifier for logs (e.g. `s3://bucket`).
    fn identifier(&self) -> &str;
}

// =============================================================================
// Metadata Store
// =============================================================================

/// Document storage for [`ImageMetadata`], keyed by filename.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create or replace the document `id`.
    async fn set(&self, id: &str, document: &ImageMetadata) -> Result<(), StoreError>;

    /// Fetch the document `id`, `None` if absent.
    async fn get(&self, id: &str) -> Result<Option<ImageMetadata>, StoreError>;

    /// Delete the document `id`. Deleting an absent id succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Every stored document id.
    async fn list_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Identifier for logs.
    fn identifier(&self) -> &str;
}

// =============================================================================
// Shared Handles
// =============================================================================

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        disallow_overwrite: bool,
    ) -> Result<String, StoreError> {
        (**self).put(key, data, content_type, disallow_overwrite).await
    }

    fn public_url(&self, key: &str) -> String {
        (**self).public_url(key)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        (**self).exists(key).await
    }

    async fn list_objects(&self) -> Result<Vec<ObjectSummary>, StoreError> {
        (**self).list_objects().await
    }

    fn identifier(&self) -> &str {
        (**self).identifier()
    }
}

#[async_trait]
impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    async fn set(&self, id: &str, document: &ImageMetadata) -> Result<(), StoreError> {
        (**self).set(id, document).await
    }

    async fn get(&self, id: &str) -> Result<Option<ImageMetadata>, StoreError> {
        (**self).get(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        (**self).delete(id).await
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        (**self).list_ids().await
    }

    fn identifier(&self) -> &str {
        (**self).identifier()
    }
}

/// Percent-encode each `/`-separated segment of a key for use in a URL path.
pub(crate) fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
