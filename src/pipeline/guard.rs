//! Store calls bounded by a deadline.
//!
//! A timed-out call has an unknown outcome: the request may still land. Each
//! guarded operation resolves that uncertainty once, by checking the store for
//! the effect it was trying to produce, and otherwise reports the timeout.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tracing::{error, warn};

use crate::error::StoreError;
use crate::metadata::ImageMetadata;
use crate::store::{MetadataStore, ObjectStore};

/// Run `call`, converting an elapsed deadline into [`StoreError::Timeout`].
pub(crate) async fn with_timeout<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Write a blob with overwrite disallowed, returning its public URL.
///
/// After a timeout the blob counts as written only if it is now present. If
/// presence cannot be established either, a best-effort delete is issued so a
/// late-landing write is not left behind.
pub(crate) async fn put_blob<O: ObjectStore + ?Sized>(
    objects: &O,
    key: &str,
    data: Bytes,
    content_type: &str,
    limit: Duration,
) -> Result<String, StoreError> {
    let timeout = match with_timeout("put image", limit, objects.put(key, data, content_type, true)).await {
        Err(timeout @ StoreError::Timeout { .. }) => timeout,
        other => return other,
    };

    warn!(key = %key, "Image write timed out; checking whether it landed");

    match with_timeout("check image", limit, objects.exists(key)).await {
        Ok(true) => Ok(objects.public_url(key)),
        Ok(false) => Err(timeout),
        Err(check) => {
            error!(key = %key, error = %check, "Could not confirm timed-out image write");
            if let Err(e) = with_timeout("delete image", limit, objects.delete(key)).await {
                warn!(key = %key, error = %e, "Best-effort delete after unknown write failed");
            }
            Err(timeout)
        }
    }
}

/// Write a metadata document. After a timeout, success iff the document is
/// now readable.
pub(crate) async fn set_metadata<M: MetadataStore + ?Sized>(
    metadata: &M,
    id: &str,
    document: &ImageMetadata,
    limit: Duration,
) -> Result<(), StoreError> {
    let timeout = match with_timeout("write metadata", limit, metadata.set(id, document)).await {
        Err(timeout @ StoreError::Timeout { .. }) => timeout,
        other => return other,
    };

    warn!(id = %id, "Metadata write timed out; checking whether it landed");

    match with_timeout("read metadata", limit, metadata.get(id)).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(timeout),
        Err(e) => {
            warn!(id = %id, error = %e, "Could not confirm timed-out metadata write");
            Err(timeout)
        }
    }
}

/// Delete a blob. After a timeout, success iff the blob is now absent.
pub(crate) async fn delete_blob<O: ObjectStore + ?Sized>(
    objects: &O,
    key: &str,
    limit: Duration,
) -> Result<(), StoreError> {
    let timeout = match with_timeout("delete image", limit, objects.delete(key)).await {
        Err(timeout @ StoreError::Timeout { .. }) => timeout,
        other => return other,
    };

    warn!(key = %key, "Image delete timed out; checking whether it landed");

    match with_timeout("check image", limit, objects.exists(key)).await {
        Ok(false) => Ok(()),
        _ => Err(timeout),
    }
}

/// Delete a metadata document. After a timeout, success iff it is now absent.
pub(crate) async fn delete_metadata<M: MetadataStore + ?Sized>(
    metadata: &M,
    id: &str,
    limit: Duration,
) -> Result<(), StoreError> {
    let timeout = match with_timeout("delete metadata", limit, metadata.delete(id)).await {
        Err(timeout @ StoreError::Timeout { .. }) => timeout,
        other => return other,
    };

    warn!(id = %id, "Metadata delete timed out; checking whether it landed");

    match with_timeout("read metadata", limit, metadata.get(id)).await {
        Ok(None) => Ok(()),
        _ => Err(timeout),
    }
}
