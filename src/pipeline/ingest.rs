use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{guard, ImageService};
use crate::encode::{compress_to_target, CompressionResult, OutputFormat};
use crate::error::{ClientInputError, CompressionError, InconsistencyWarning, PipelineError, StoreError};
use crate::metadata::{validate_metadata_json, MetadataDraft, StoredImageRecord};
use crate::store::{MetadataStore, ObjectStore};

/// An uploaded image as received, before any processing.
#[derive(Debug, Clone)]
pub struct RawImageInput {
    pub data: Bytes,
    pub mime_type: String,
}

impl RawImageInput {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Filename extension for a declared MIME type.
///
/// The type must be `image/<subtype>`. Parameters (`; charset=…`) and
/// structured suffixes (`+xml`) are dropped and the subtype is lower-cased:
/// `image/svg+xml` gives `svg`, `image/JPEG; q=1` gives `jpeg`.
pub fn extension_for_mime(mime_type: &str) -> Result<String, ClientInputError> {
    let invalid = || ClientInputError::InvalidMimeType(mime_type.to_string());

    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let subtype = essence.strip_prefix("image/").ok_or_else(invalid)?;
    let subtype = subtype.split('+').next().unwrap_or_default();

    let valid = !subtype.is_empty()
        && subtype
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'));

    if valid {
        Ok(subtype.to_string())
    } else {
        Err(invalid())
    }
}

impl<O: ObjectStore + 'static, M: MetadataStore + 'static> ImageService<O, M> {
    /// Validate, compress and persist an uploaded image.
    ///
    /// Client input and compression failures happen before any store is
    /// touched. Once the blob write has been issued the remaining sequence
    /// runs in a detached task, so dropping the returned future does not
    /// abandon a half-written image.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::ClientInput`]: bad MIME type, empty payload or
    ///   invalid metadata
    /// - [`PipelineError::Compression`]: the image could not be decoded or
    ///   encoded
    /// - [`PipelineError::UpstreamStore`]: a store call failed; carries an
    ///   orphan-blob warning if compensation also failed, or a
    ///   dangling-metadata warning if a timed-out metadata write may still land
    pub async fn ingest(
        &self,
        input: RawImageInput,
        raw_metadata: Option<&str>,
        author_id: Option<&str>,
    ) -> Result<StoredImageRecord, PipelineError> {
        let extension = extension_for_mime(&input.mime_type)?;
        if input.is_empty() {
            return Err(ClientInputError::EmptyFile.into());
        }

        let filename = format!("{}.{}", Uuid::new_v4(), extension);
        let draft = validate_metadata_json(raw_metadata.unwrap_or_default(), author_id, &filename)
            .map_err(ClientInputError::InvalidMetadata)?;

        let format = OutputFormat::from_mime(&input.mime_type);
        let encoded = self.encode(input, format).await?;

        if encoded.target_met {
            info!(
                filename = %filename,
                width = encoded.width,
                height = encoded.height,
                quality = encoded.achieved_quality,
                size = encoded.bytes.len(),
                attempts = encoded.attempts,
                "Compressed image"
            );
        } else {
            warn!(
                filename = %filename,
                quality = encoded.achieved_quality,
                size = encoded.bytes.len(),
                target = self.target.target_size_bytes(),
                "Image exceeds size target at quality floor"
            );
        }

        let service = self.clone();
        tokio::spawn(async move { service.persist(draft, encoded).await })
            .await
            .map_err(|e| PipelineError::Internal(format!("persistence task failed: {}", e)))?
    }

    /// Run the quality search on the blocking pool.
    async fn encode(
        &self,
        input: RawImageInput,
        format: OutputFormat,
    ) -> Result<CompressionResult, CompressionError> {
        let target = self.target.with_format(format);
        let source = input.data;

        tokio::task::spawn_blocking(move || compress_to_target(&source, &target))
            .await
            .map_err(|e| CompressionError::Worker(e.to_string()))?
    }

    /// Write blob then metadata, compensating if the metadata write fails.
    async fn persist(
        &self,
        draft: MetadataDraft,
        encoded: CompressionResult,
    ) -> Result<StoredImageRecord, PipelineError> {
        let filename = draft.filename.clone();

        let url = guard::put_blob(
            self.objects.as_ref(),
            &filename,
            encoded.bytes,
            encoded.format.mime_type(),
            self.store_timeout,
        )
        .await
        .map_err(|e| {
            error!(filename = %filename, error = %e, "Image write failed");
            PipelineError::upstream("store image", &filename, e)
        })?;

        let document = draft.stamp(Utc::now());

        if let Err(e) = guard::set_metadata(
            self.metadata.as_ref(),
            &filename,
            &document,
            self.store_timeout,
        )
        .await
        {
            return Err(self.compensate(filename, e).await);
        }

        debug!(filename = %filename, url = %url, "Stored image and metadata");

        Ok(StoredImageRecord {
            filename,
            metadata: document,
            url,
        })
    }

    /// Remove the blob whose metadata could not be written. Exactly one
    /// attempt; a failure is reported as an orphan blob.
    ///
    /// A timed-out metadata write may still land after the blob is gone, so
    /// it also gets one best-effort metadata delete and is always reported
    /// as possibly dangling metadata.
    async fn compensate(&self, filename: String, cause: StoreError) -> PipelineError {
        error!(filename = %filename, error = %cause, "Metadata write failed; removing image");

        let warning =
            match guard::delete_blob(self.objects.as_ref(), &filename, self.store_timeout).await {
                Err(e) => Some(InconsistencyWarning::OrphanBlob {
                    filename: filename.clone(),
                    reason: format!(
                        "metadata write failed ({}); compensating delete failed ({})",
                        cause, e
                    ),
                }),
                Ok(()) if matches!(cause, StoreError::Timeout { .. }) => {
                    if let Err(e) = guard::delete_metadata(
                        self.metadata.as_ref(),
                        &filename,
                        self.store_timeout,
                    )
                    .await
                    {
                        warn!(filename = %filename, error = %e, "Metadata cleanup after timeout failed");
                    }
                    Some(InconsistencyWarning::DanglingMetadata {
                        filename: filename.clone(),
                        reason: format!(
                            "metadata write outcome unknown ({}); it may land after the image was removed",
                            cause
                        ),
                    })
                }
                Ok(()) => None,
            };

        if let Some(warning) = &warning {
            self.report_inconsistency(warning);
        }

        PipelineError::UpstreamStore {
            operation: "write metadata",
            filename,
            source: cause,
            inconsistency: warning,
        }
    }
}
