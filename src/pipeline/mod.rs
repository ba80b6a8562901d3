//! Ingestion and deletion orchestration.
//!
//! The [`ImageService`] sequences calls across the object store and the
//! metadata store. There is no transaction spanning the two, so ordering and
//! compensation keep the filename invariant: metadata only ever exists for a
//! blob whose write succeeded.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ImageService                            │
//! │                                                                  │
//! │  ingest()                            delete()                    │
//! │   1. check MIME type                  1. check filename          │
//! │   2. validate metadata                2. delete blob ──┐ abort   │
//! │   3. encode (blocking pool)           3. delete metadata  on err │
//! │   4. put blob ─────┐ abort on err        └─ err → warning        │
//! │   5. set metadata  │                                             │
//! │      └─ err → compensating blob delete                           │
//! │         (timeout → also delete metadata, warn)                   │
//! │   6. return record                                               │
//! │                                                                  │
//! │  Steps touching stores run in a detached task and every store    │
//! │  call is bounded by a timeout (see `guard`).                     │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 ▼                                  ▼
//!          ┌─────────────┐                   ┌───────────────┐
//!          │ ObjectStore │                   │ MetadataStore │
//!          └─────────────┘                   └───────────────┘
//! ```
//!
//! Detected inconsistencies are logged at WARN and counted; they never turn a
//! deletion into a failure.

mod delete;
mod guard;
mod ingest;
mod reconcile;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::encode::CompressionTarget;
use crate::error::{ClientInputError, InconsistencyWarning, PipelineError};
use crate::metadata::{ImageMetadata, StoredImageRecord};
use crate::store::{MetadataStore, ObjectStore};

pub use delete::DeleteOutcome;
pub use ingest::{extension_for_mime, RawImageInput};
pub use reconcile::{
    reconcile, repair, ReconcileReport, RepairOptions, RepairSummary, DEFAULT_MIN_ORPHAN_AGE,
};

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Record Lookup
// =============================================================================

/// Outcome of looking up the stored record for a filename.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordLookup {
    /// Metadata and blob are both present
    Found(StoredImageRecord),

    /// Metadata exists but its blob is gone
    BrokenLink(ImageMetadata),

    /// No metadata document for this filename
    NotFound,
}

// =============================================================================
// Image Service
// =============================================================================

/// Orchestrates image ingestion, lookup and deletion over two stores.
///
/// # Type Parameters
///
/// * `O` - The object store holding compressed images
/// * `M` - The metadata store holding one document per image
///
/// # Example
///
/// ```ignore
/// use image_ingest::pipeline::{ImageService, RawImageInput};
/// use image_ingest::store::{MemoryMetadataStore, MemoryObjectStore};
///
/// let service = ImageService::new(MemoryObjectStore::default(), MemoryMetadataStore::new());
/// let input = RawImageInput::new(bytes, "image/jpeg");
/// let record = service.ingest(input, Some(r#"{"groupId":"g1"}"#), Some("user-1")).await?;
/// println!("{} stored at {}", record.filename, record.url);
/// ```
pub struct ImageService<O: ObjectStore, M: MetadataStore> {
    objects: Arc<O>,
    metadata: Arc<M>,
    target: CompressionTarget,
    store_timeout: Duration,
    inconsistencies: Arc<AtomicU64>,
}

impl<O: ObjectStore, M: MetadataStore> Clone for ImageService<O, M> {
    fn clone(&self) -> Self {
        Self {
            objects: Arc::clone(&self.objects),
            metadata: Arc::clone(&self.metadata),
            target: self.target,
            store_timeout: self.store_timeout,
            inconsistencies: Arc::clone(&self.inconsistencies),
        }
    }
}

impl<O: ObjectStore + 'static, M: MetadataStore + 'static> ImageService<O, M> {
    /// Create a service with the default compression target and timeout.
    pub fn new(objects: O, metadata: M) -> Self {
        Self::with_shared_stores(Arc::new(objects), Arc::new(metadata))
    }

    /// Create a service over stores that are also held elsewhere.
    pub fn with_shared_stores(objects: Arc<O>, metadata: Arc<M>) -> Self {
        Self {
            objects,
            metadata,
            target: CompressionTarget::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            inconsistencies: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Set the compression target. The output format is chosen per request.
    pub fn with_target(mut self, target: CompressionTarget) -> Self {
        self.target = target;
        self
    }

    /// Set the deadline applied to each store call.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn objects(&self) -> &O {
        &self.objects
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn target(&self) -> &CompressionTarget {
        &self.target
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Number of inconsistencies detected since the service was created.
    pub fn inconsistency_count(&self) -> u64 {
        self.inconsistencies.load(Ordering::Relaxed)
    }

    /// Public URL of the blob stored under `key`.
    pub fn public_url(&self, key: &str) -> String {
        self.objects.public_url(key)
    }

    /// Look up the record for `filename`, checking that its blob still exists.
    pub async fn record(&self, filename: &str) -> Result<RecordLookup, PipelineError> {
        if filename.trim().is_empty() {
            return Err(ClientInputError::MissingFilename.into());
        }

        let document = guard::with_timeout(
            "read metadata",
            self.store_timeout,
            self.metadata.get(filename),
        )
        .await
        .map_err(|e| {
            error!(filename = %filename, error = %e, "Metadata lookup failed");
            PipelineError::upstream("read metadata", filename, e)
        })?;

        let Some(document) = document else {
            return Ok(RecordLookup::NotFound);
        };

        let exists = guard::with_timeout(
            "check image",
            self.store_timeout,
            self.objects.exists(filename),
        )
        .await
        .map_err(|e| {
            error!(filename = %filename, error = %e, "Image existence check failed");
            PipelineError::upstream("check image", filename, e)
        })?;

        if !exists {
            debug!(filename = %filename, "Metadata references a missing image");
            return Ok(RecordLookup::BrokenLink(document));
        }

        Ok(RecordLookup::Found(StoredImageRecord {
            filename: filename.to_string(),
            url: self.objects.public_url(filename),
            metadata: document,
        }))
    }

    /// Log and count a detected inconsistency.
    pub(crate) fn report_inconsistency(&self, warning: &InconsistencyWarning) {
        let total = self.inconsistencies.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            kind = warning.kind(),
            filename = %warning.filename(),
            total = total,
            "{}",
            warning
        );
    }
}
