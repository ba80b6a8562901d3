//! Out-of-band consistency checks between the two stores.
//!
//! Ingestion and deletion report inconsistencies they cause but cannot repair
//! them. The reconciler enumerates both stores and finds:
//!
//! - **orphan blobs**: objects with no metadata document
//! - **dangling metadata**: documents whose object is gone
//!
//! An ingestion caught between its blob write and its metadata write looks
//! exactly like an orphan. Repair therefore only deletes orphans whose last
//! write is older than [`RepairOptions::min_orphan_age`], which must exceed
//! the longest an ingestion can take (a handful of store timeouts). Each
//! finding is also re-checked just before it is deleted, and every store call
//! is bounded by [`RepairOptions::store_timeout`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{guard, DEFAULT_STORE_TIMEOUT};
use crate::error::{InconsistencyWarning, StoreError};
use crate::store::{MetadataStore, ObjectStore, ObjectSummary};

/// Default minimum age of an orphan blob before repair deletes it.
pub const DEFAULT_MIN_ORPHAN_AGE: Duration = Duration::from_secs(600);

/// Findings of one reconciliation scan. Lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub blobs_scanned: usize,
    pub documents_scanned: usize,
    pub orphan_blobs: Vec<ObjectSummary>,
    pub dangling_metadata: Vec<String>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.orphan_blobs.is_empty() && self.dangling_metadata.is_empty()
    }

    /// Keys of the orphan blobs.
    pub fn orphan_keys(&self) -> Vec<&str> {
        self.orphan_blobs.iter().map(|o| o.key.as_str()).collect()
    }

    /// The findings as inconsistency warnings.
    pub fn warnings(&self) -> Vec<InconsistencyWarning> {
        let orphans = self.orphan_blobs.iter().map(|orphan| InconsistencyWarning::OrphanBlob {
            filename: orphan.key.clone(),
            reason: "no metadata document".to_string(),
        });
        let dangling = self
            .dangling_metadata
            .iter()
            .map(|filename| InconsistencyWarning::DanglingMetadata {
                filename: filename.clone(),
                reason: "no stored image".to_string(),
            });
        orphans.chain(dangling).collect()
    }
}

/// Which findings [`repair`] should delete, and how carefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairOptions {
    pub delete_orphans: bool,
    pub delete_dangling: bool,

    /// Orphans written more recently than this are left alone.
    pub min_orphan_age: Duration,

    /// Deadline for each store call.
    pub store_timeout: Duration,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            delete_orphans: false,
            delete_dangling: false,
            min_orphan_age: DEFAULT_MIN_ORPHAN_AGE,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

/// What [`repair`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub orphans_deleted: usize,
    pub dangling_deleted: usize,

    /// Findings that healed between the scan and the repair.
    pub skipped: usize,

    /// Orphans too young to tell apart from an ingestion in progress.
    pub too_recent: usize,

    pub failures: Vec<String>,
}

/// Compare every blob key with every metadata id.
pub async fn reconcile<O, M>(
    objects: &O,
    metadata: &M,
    limit: Duration,
) -> Result<ReconcileReport, StoreError>
where
    O: ObjectStore + ?Sized,
    M: MetadataStore + ?Sized,
{
    let blobs: BTreeMap<String, ObjectSummary> =
        guard::with_timeout("list images", limit, objects.list_objects())
            .await?
            .into_iter()
            .map(|object| (object.key.clone(), object))
            .collect();
    let ids: BTreeSet<String> = guard::with_timeout("list metadata", limit, metadata.list_ids())
        .await?
        .into_iter()
        .collect();

    let report = ReconcileReport {
        blobs_scanned: blobs.len(),
        documents_scanned: ids.len(),
        orphan_blobs: blobs
            .values()
            .filter(|object| !ids.contains(&object.key))
            .cloned()
            .collect(),
        dangling_metadata: ids
            .iter()
            .filter(|id| !blobs.contains_key(id.as_str()))
            .cloned()
            .collect(),
    };

    info!(
        objects = %objects.identifier(),
        metadata = %metadata.identifier(),
        blobs = report.blobs_scanned,
        documents = report.documents_scanned,
        orphans = report.orphan_blobs.len(),
        dangling = report.dangling_metadata.len(),
        "Reconciliation scan complete"
    );

    Ok(report)
}

/// Delete the findings selected by `options`.
///
/// Failures are collected rather than aborting the pass.
pub async fn repair<O, M>(
    objects: &O,
    metadata: &M,
    report: &ReconcileReport,
    options: RepairOptions,
) -> RepairSummary
where
    O: ObjectStore + ?Sized,
    M: MetadataStore + ?Sized,
{
    let limit = options.store_timeout;
    let mut summary = RepairSummary::default();

    if options.delete_orphans {
        let now = Utc::now();

        for orphan in &report.orphan_blobs {
            let key = orphan.key.as_str();

            // Unknown age counts as too recent
            if !orphan.age(now).is_some_and(|age| age >= options.min_orphan_age) {
                debug!(key = %key, last_modified = ?orphan.last_modified, "Orphan blob too recent to delete");
                summary.too_recent += 1;
                continue;
            }

            match guard::with_timeout("check metadata", limit, metadata.get(key)).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Could not re-check orphan blob");
                    summary.failures.push(format!("{}: {}", key, e));
                    continue;
                }
            }

            match guard::with_timeout("delete image", limit, objects.delete(key)).await {
                Ok(()) => summary.orphans_deleted += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to delete orphan blob");
                    summary.failures.push(format!("{}: {}", key, e));
                }
            }
        }
    }

    if options.delete_dangling {
        for id in &report.dangling_metadata {
            match guard::with_timeout("check image", limit, objects.exists(id)).await {
                Ok(false) => {}
                Ok(true) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Could not re-check dangling metadata");
                    summary.failures.push(format!("{}: {}", id, e));
                    continue;
                }
            }

            match guard::with_timeout("delete metadata", limit, metadata.delete(id)).await {
                Ok(()) => summary.dangling_deleted += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to delete dangling metadata");
                    summary.failures.push(format!("{}: {}", id, e));
                }
            }
        }
    }

    summary
}
