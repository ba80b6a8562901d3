use tracing::{error, info};

use super::{guard, ImageService};
use crate::error::{ClientInputError, InconsistencyWarning, PipelineError};
use crate::store::{MetadataStore, ObjectStore};

/// Result of a successful deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub filename: String,

    /// Set when the blob was removed but its metadata could not be removed.
    pub inconsistency: Option<InconsistencyWarning>,
}

impl DeleteOutcome {
    /// Whether both stores are now free of `filename`.
    pub fn is_clean(&self) -> bool {
        self.inconsistency.is_none()
    }
}

impl<O: ObjectStore + 'static, M: MetadataStore + 'static> ImageService<O, M> {
    /// Delete the blob and then the metadata stored under `filename`.
    ///
    /// Idempotent: deleting something already gone succeeds. A failed blob
    /// delete aborts before metadata is touched. A failed metadata delete
    /// after the blob is gone is still a success, carrying a
    /// dangling-metadata warning.
    pub async fn delete(&self, filename: &str) -> Result<DeleteOutcome, PipelineError> {
        if filename.trim().is_empty() {
            return Err(ClientInputError::MissingFilename.into());
        }

        let service = self.clone();
        let filename = filename.to_string();
        tokio::spawn(async move { service.remove(filename).await })
            .await
            .map_err(|e| PipelineError::Internal(format!("deletion task failed: {}", e)))?
    }

    async fn remove(&self, filename: String) -> Result<DeleteOutcome, PipelineError> {
        guard::delete_blob(self.objects.as_ref(), &filename, self.store_timeout)
            .await
            .map_err(|e| {
                error!(filename = %filename, error = %e, "Image delete failed");
                PipelineError::upstream("delete image", &filename, e)
            })?;

        let inconsistency =
            match guard::delete_metadata(self.metadata.as_ref(), &filename, self.store_timeout)
                .await
            {
                Ok(()) => None,
                Err(e) => {
                    let warning = InconsistencyWarning::DanglingMetadata {
                        filename: filename.clone(),
                        reason: format!("metadata delete failed: {}", e),
                    };
                    self.report_inconsistency(&warning);
                    Some(warning)
                }
            };

        info!(filename = %filename, clean = inconsistency.is_none(), "Deleted image");

        Ok(DeleteOutcome {
            filename,
            inconsistency,
        })
    }
}
