//! Ingestion and deletion orchestration tests.
//!
//! These run the real encoder against recording store doubles and check the
//! order of store calls, compensation, timeout resolution and the
//! inconsistencies reported when compensation itself fails.

use std::collections::HashSet;
use std::time::Duration;

use image_ingest::encode::CompressionTarget;
use image_ingest::error::{ClientInputError, CompressionError, InconsistencyWarning, PipelineError, StoreError};
use image_ingest::pipeline::{RawImageInput, RecordLookup};
use image_ingest::store::{MetadataStore, ObjectStore};

use super::test_utils::{
    connection_error, create_noisy_jpeg, create_test_jpeg, create_test_png, is_valid_jpeg,
    is_valid_png, Fault, Harness, Op,
};

fn jpeg_input(width: u32, height: u32) -> RawImageInput {
    RawImageInput::new(create_test_jpeg(width, height, 85), "image/jpeg")
}

// =============================================================================
// Successful Ingestion
// =============================================================================

#[tokio::test]
async fn test_ingest_large_photo_fits_dimension_and_budget() {
    let h = Harness::new();
    let target = CompressionTarget::new(1024, 300 * 1024, 90, 10, 5).unwrap();
    let service = h.service.clone().with_target(target);

    let input = jpeg_input(4000, 3000);
    let record = service
        .ingest(input, Some(r#"{"groupId":"holiday"}"#), Some("user-1"))
        .await
        .unwrap();

    assert!(record.filename.ends_with(".jpeg"));
    assert_eq!(record.url, format!("https://cdn.test/{}", record.filename));
    assert_eq!(record.metadata.filename, record.filename);
    assert_eq!(record.metadata.author_id.as_deref(), Some("user-1"));
    assert_eq!(record.metadata.group_id.as_deref(), Some("holiday"));

    let stored = h.objects.inner().get(&record.filename).await.unwrap();
    assert_eq!(stored.content_type, "image/jpeg");
    assert!(is_valid_jpeg(&stored.data));
    assert!(stored.data.len() <= 300 * 1024);

    let decoded = image::load_from_memory(&stored.data).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (1024, 768));

    let document = h.metadata.inner().get(&record.filename).await.unwrap().unwrap();
    assert_eq!(document, record.metadata);

    assert_eq!(
        h.log.operations().await,
        vec!["object.put", "metadata.set"],
        "blob must be written before metadata"
    );
}

#[tokio::test]
async fn test_ingest_steps_quality_down_for_noisy_image() {
    let h = Harness::new();
    let target = CompressionTarget::new(2048, 60 * 1024, 90, 10, 10).unwrap();
    let service = h.service.clone().with_target(target);

    let source = create_noisy_jpeg(800, 600, 95);
    let at_start_quality = create_noisy_jpeg(800, 600, 90);
    assert!(at_start_quality.len() > 60 * 1024);

    let record = service
        .ingest(RawImageInput::new(source, "image/jpeg"), None, None)
        .await
        .unwrap();

    let stored = h.objects.inner().get(&record.filename).await.unwrap();
    assert!(is_valid_jpeg(&stored.data));
    assert!(stored.data.len() < at_start_quality.len());
}

#[tokio::test]
async fn test_ingest_png_stays_png() {
    let h = Harness::new();

    let record = h
        .service
        .ingest(RawImageInput::new(create_test_png(64, 48), "image/png"), None, None)
        .await
        .unwrap();

    assert!(record.filename.ends_with(".png"));
    let stored = h.objects.inner().get(&record.filename).await.unwrap();
    assert_eq!(stored.content_type, "image/png");
    assert!(is_valid_png(&stored.data));
}

#[tokio::test]
async fn test_ingest_small_image_is_not_upscaled() {
    let h = Harness::new();

    let record = h.service.ingest(jpeg_input(40, 30), None, None).await.unwrap();

    let stored = h.objects.inner().get(&record.filename).await.unwrap();
    let decoded = image::load_from_memory(&stored.data).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (40, 30));
}

#[tokio::test]
async fn test_ingest_overrides_client_server_fields() {
    let h = Harness::new();

    let raw = r#"{
        "filename": "evil.jpeg",
        "createdAt": "1999-01-01T00:00:00.000Z",
        "authorId": "mallory",
        "caption": "sunset"
    }"#;
    let record = h
        .service
        .ingest(jpeg_input(32, 32), Some(raw), Some("alice"))
        .await
        .unwrap();

    assert_ne!(record.filename, "evil.jpeg");
    assert_eq!(record.metadata.filename, record.filename);
    assert_eq!(record.metadata.author_id.as_deref(), Some("alice"));
    assert!(record.metadata.created_at.timestamp() > 946_684_800);
    assert_eq!(record.metadata.extra.get("caption").unwrap(), "sunset");
    assert!(!record.metadata.extra.contains_key("filename"));
}

#[tokio::test]
async fn test_concurrent_ingests_get_distinct_filenames() {
    let h = Harness::new();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            service.ingest(jpeg_input(16, 16), None, None).await.unwrap()
        }));
    }

    let mut names = HashSet::new();
    for handle in handles {
        names.insert(handle.await.unwrap().filename);
    }

    assert_eq!(names.len(), 8);
    assert_eq!(h.objects.inner().len().await, 8);
    assert_eq!(h.metadata.inner().len().await, 8);
}

// =============================================================================
// Rejected Input
// =============================================================================

#[tokio::test]
async fn test_invalid_mime_type_touches_no_store() {
    let h = Harness::new();

    let input = RawImageInput::new(create_test_jpeg(8, 8, 80), "application/pdf");
    let err = h.service.ingest(input, None, None).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ClientInput(ClientInputError::InvalidMimeType(_))
    ));
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_empty_file_touches_no_store() {
    let h = Harness::new();

    let input = RawImageInput::new(Vec::<u8>::new(), "image/jpeg");
    let err = h.service.ingest(input, None, None).await.unwrap_err();

    assert!(matches!(err, PipelineError::ClientInput(ClientInputError::EmptyFile)));
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_invalid_metadata_touches_no_store() {
    let h = Harness::new();

    for raw in ["not json", "[1, 2]", r#"{"groupId": 7}"#] {
        let err = h
            .service
            .ingest(jpeg_input(8, 8), Some(raw), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, PipelineError::ClientInput(ClientInputError::InvalidMetadata(_))),
            "metadata {:?} should be rejected",
            raw
        );
    }

    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_undecodable_image_touches_no_store() {
    let h = Harness::new();

    let input = RawImageInput::new(b"definitely not a jpeg".to_vec(), "image/jpeg");
    let err = h.service.ingest(input, None, None).await.unwrap_err();

    assert!(matches!(err, PipelineError::Compression(_)));
    assert!(!matches!(err, PipelineError::Compression(CompressionError::Worker(_))));
    assert!(h.log.entries().await.is_empty());
}

// =============================================================================
// Partial Failures
// =============================================================================

#[tokio::test]
async fn test_metadata_failure_compensates_with_one_delete() {
    let h = Harness::new();
    h.metadata.fail(Op::Set, connection_error()).await;

    let err = h.service.ingest(jpeg_input(32, 32), None, None).await.unwrap_err();

    match &err {
        PipelineError::UpstreamStore {
            operation,
            inconsistency,
            ..
        } => {
            assert_eq!(*operation, "write metadata");
            assert!(inconsistency.is_none());
        }
        other => panic!("expected upstream error, got {:?}", other),
    }

    assert_eq!(
        h.log.operations().await,
        vec!["object.put", "metadata.set", "object.delete"]
    );
    assert!(h.objects.inner().is_empty().await);
    assert_eq!(h.service.inconsistency_count(), 0);
}

#[tokio::test]
async fn test_failed_compensation_reports_orphan_blob() {
    let h = Harness::new();
    h.metadata.fail(Op::Set, connection_error()).await;
    h.objects.fail(Op::Delete, connection_error()).await;

    let err = h.service.ingest(jpeg_input(32, 32), None, None).await.unwrap_err();

    let warning = err.inconsistency().cloned().unwrap();
    assert!(matches!(warning, InconsistencyWarning::OrphanBlob { .. }));
    assert_eq!(warning.kind(), "orphan_blob");

    assert_eq!(h.log.count("object.delete").await, 1, "compensation is not retried");
    assert!(h.objects.inner().get(warning.filename()).await.is_some());
    assert!(h.metadata.inner().is_empty().await);
    assert_eq!(h.service.inconsistency_count(), 1);
}

#[tokio::test]
async fn test_existing_blob_is_never_overwritten() {
    let h = Harness::new();
    h.objects
        .fail(Op::Put, Fault::Error(StoreError::AlreadyExists("taken".to_string())))
        .await;

    let err = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UpstreamStore {
            source: StoreError::AlreadyExists(_),
            ..
        }
    ));
    assert_eq!(h.log.operations().await, vec!["object.put"]);
    assert!(h.metadata.inner().is_empty().await);
}

#[tokio::test]
async fn test_blob_failure_skips_metadata_and_compensation() {
    let h = Harness::new();
    h.objects.fail(Op::Put, connection_error()).await;

    let err = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UpstreamStore {
            operation: "store image",
            ..
        }
    ));
    assert_eq!(h.log.operations().await, vec!["object.put"]);
}

// =============================================================================
// Timeouts
// =============================================================================

#[tokio::test]
async fn test_timed_out_blob_write_that_landed_succeeds() {
    let h = Harness::new();
    h.objects.fail(Op::Put, Fault::ApplyThenStall).await;

    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();

    assert!(h.objects.inner().get(&record.filename).await.is_some());
    assert!(h.metadata.inner().get(&record.filename).await.unwrap().is_some());
    assert_eq!(
        h.log.operations().await,
        vec!["object.put", "object.exists", "metadata.set"]
    );
}

#[tokio::test]
async fn test_timed_out_blob_write_that_never_landed_fails() {
    let h = Harness::new();
    h.objects.fail(Op::Put, Fault::Stall).await;

    let err = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UpstreamStore {
            source: StoreError::Timeout { .. },
            ..
        }
    ));
    assert_eq!(h.log.count("metadata.set").await, 0);
    assert!(h.objects.inner().is_empty().await);
}

#[tokio::test]
async fn test_timed_out_metadata_write_that_landed_succeeds() {
    let h = Harness::new();
    h.metadata.fail(Op::Set, Fault::ApplyThenStall).await;

    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();

    assert!(h.objects.inner().get(&record.filename).await.is_some());
    assert_eq!(h.log.count("metadata.get").await, 1);
    assert_eq!(h.log.count("object.delete").await, 0);
}

#[tokio::test]
async fn test_timed_out_metadata_write_that_never_landed_compensates() {
    let h = Harness::new();
    h.metadata.fail(Op::Set, Fault::Stall).await;

    let err = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap_err();

    // The write might still land, so the outcome is reported as unconfirmed
    let warning = err.inconsistency().unwrap();
    assert!(matches!(warning, InconsistencyWarning::DanglingMetadata { .. }));
    assert_eq!(h.service.inconsistency_count(), 1);
    assert_eq!(h.log.count("object.delete").await, 1);
    assert_eq!(h.log.count("metadata.delete").await, 1);
    assert!(h.objects.inner().is_empty().await);
    assert!(h.metadata.inner().is_empty().await);
}

#[tokio::test]
async fn test_metadata_write_landing_after_deadline_is_reported() {
    let h = Harness::new();
    h.metadata
        .fail(Op::Set, Fault::LandLate(Duration::from_millis(300)))
        .await;

    let err = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap_err();

    let warning = err.inconsistency().unwrap().clone();
    assert!(matches!(warning, InconsistencyWarning::DanglingMetadata { .. }));
    assert_eq!(h.service.inconsistency_count(), 1);
    assert_eq!(
        h.log.operations().await,
        vec![
            "object.put",
            "metadata.set",
            "metadata.get",
            "object.delete",
            "metadata.delete"
        ]
    );

    // Once the write lands, the document outlives its image as warned
    tokio::time::sleep(Duration::from_millis(400)).await;
    let filename = warning.filename();
    assert!(h.objects.inner().get(filename).await.is_none());
    assert!(h.metadata.inner().get(filename).await.unwrap().is_some());
}

#[tokio::test]
async fn test_dropped_ingest_still_completes() {
    let h = Harness::new();
    h.objects
        .fail(Op::Put, Fault::Delay(Duration::from_millis(50)))
        .await;

    let service = h.service.clone();
    let caller = tokio::spawn(async move { service.ingest(jpeg_input(16, 16), None, None).await });

    // Hang up while the slow blob write is in flight
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.log.count("object.put").await == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_millis(300)).await;

    let entries = h.log.entries().await;
    let filename = entries[0].strip_prefix("object.put:").unwrap();
    assert_eq!(h.log.operations().await, vec!["object.put", "metadata.set"]);
    assert!(h.objects.inner().get(filename).await.is_some());
    assert!(h.metadata.inner().get(filename).await.unwrap().is_some());
}

// =============================================================================
// Deletion
// =============================================================================

#[tokio::test]
async fn test_delete_removes_blob_then_metadata() {
    let h = Harness::new();
    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();
    h.log.clear().await;

    let outcome = h.service.delete(&record.filename).await.unwrap();

    assert!(outcome.is_clean());
    assert_eq!(outcome.filename, record.filename);
    assert_eq!(
        h.log.operations().await,
        vec!["object.delete", "metadata.delete"]
    );
    assert!(h.objects.inner().is_empty().await);
    assert!(h.metadata.inner().is_empty().await);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let h = Harness::new();

    assert!(h.service.delete("never-existed.jpeg").await.unwrap().is_clean());
    assert!(h.service.delete("never-existed.jpeg").await.unwrap().is_clean());

    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();
    assert!(h.service.delete(&record.filename).await.unwrap().is_clean());
    h.log.clear().await;

    let again = h.service.delete(&record.filename).await.unwrap();

    assert!(again.is_clean());
    assert_eq!(
        h.log.operations().await,
        vec!["object.delete", "metadata.delete"]
    );
    assert!(h.objects.inner().is_empty().await);
    assert!(h.metadata.inner().is_empty().await);
}

#[tokio::test]
async fn test_delete_rejects_blank_filename() {
    let h = Harness::new();

    let err = h.service.delete("  ").await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::ClientInput(ClientInputError::MissingFilename)
    ));
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_failed_blob_delete_leaves_metadata_alone() {
    let h = Harness::new();
    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();
    h.log.clear().await;
    h.objects.fail(Op::Delete, connection_error()).await;

    let err = h.service.delete(&record.filename).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UpstreamStore {
            operation: "delete image",
            ..
        }
    ));
    assert_eq!(h.log.operations().await, vec!["object.delete"]);
    assert!(h.metadata.inner().get(&record.filename).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_metadata_delete_reports_dangling_metadata() {
    let h = Harness::new();
    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();
    h.metadata.fail(Op::Delete, connection_error()).await;

    let outcome = h.service.delete(&record.filename).await.unwrap();

    let warning = outcome.inconsistency.unwrap();
    assert!(matches!(warning, InconsistencyWarning::DanglingMetadata { .. }));
    assert_eq!(warning.filename(), record.filename);
    assert!(h.objects.inner().is_empty().await);
    assert_eq!(h.service.inconsistency_count(), 1);
}

#[tokio::test]
async fn test_timed_out_blob_delete_that_landed_succeeds() {
    let h = Harness::new();
    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();
    h.objects.fail(Op::Delete, Fault::ApplyThenStall).await;

    let outcome = h.service.delete(&record.filename).await.unwrap();

    assert!(outcome.is_clean());
    assert!(h.metadata.inner().is_empty().await);
}

// =============================================================================
// Record Lookup
// =============================================================================

#[tokio::test]
async fn test_record_lookup_states() {
    let h = Harness::new();
    let record = h.service.ingest(jpeg_input(16, 16), None, None).await.unwrap();

    match h.service.record(&record.filename).await.unwrap() {
        RecordLookup::Found(found) => assert_eq!(found, record),
        other => panic!("expected found, got {:?}", other),
    }

    assert_eq!(
        h.service.record("missing.jpeg").await.unwrap(),
        RecordLookup::NotFound
    );

    h.objects.inner().delete(&record.filename).await.unwrap();
    assert_eq!(
        h.service.record(&record.filename).await.unwrap(),
        RecordLookup::BrokenLink(record.metadata.clone())
    );
}

#[tokio::test]
async fn test_record_lookup_times_out() {
    let h = Harness::new();
    h.metadata.fail(Op::Get, Fault::Stall).await;

    let started = std::time::Instant::now();
    let err = h.service.record("slow.jpeg").await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::UpstreamStore {
            source: StoreError::Timeout { .. },
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}
