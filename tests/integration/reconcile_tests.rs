//! Reconciliation integration tests.
//!
//! Inconsistencies are produced the way production produces them (a failed
//! compensating delete, a failed metadata delete) and then found and repaired
//! by the offline scan.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Map;

use image_ingest::error::StoreError;
use image_ingest::metadata::ImageMetadata;
use image_ingest::pipeline::{reconcile, repair, RawImageInput, RepairOptions};
use image_ingest::store::{MetadataStore, ObjectStore};

use super::test_utils::{connection_error, create_test_jpeg, Fault, Harness, Op};

fn document(filename: &str) -> ImageMetadata {
    ImageMetadata {
        filename: filename.to_string(),
        created_at: Utc::now(),
        author_id: None,
        group_id: None,
        extra: Map::new(),
    }
}

async fn ingest(h: &Harness) -> Result<String, image_ingest::PipelineError> {
    let input = RawImageInput::new(create_test_jpeg(16, 16, 80), "image/jpeg");
    h.service.ingest(input, None, None).await.map(|r| r.filename)
}

const LIMIT: Duration = Duration::from_millis(100);

/// Delete everything, regardless of age.
fn repair_all() -> RepairOptions {
    RepairOptions {
        delete_orphans: true,
        delete_dangling: true,
        min_orphan_age: Duration::ZERO,
        store_timeout: LIMIT,
    }
}

#[tokio::test]
async fn test_consistent_stores_report_nothing() {
    let h = Harness::new();
    ingest(&h).await.unwrap();
    ingest(&h).await.unwrap();

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();

    assert!(report.is_consistent());
    assert_eq!(report.blobs_scanned, 2);
    assert_eq!(report.documents_scanned, 2);
}

#[tokio::test]
async fn test_finds_and_repairs_failure_leftovers() {
    let h = Harness::new();
    let kept = ingest(&h).await.unwrap();

    // Orphan blob: metadata write and its compensation both fail
    h.metadata.fail(Op::Set, connection_error()).await;
    h.objects.fail(Op::Delete, connection_error()).await;
    let orphan = ingest(&h)
        .await
        .unwrap_err()
        .inconsistency()
        .unwrap()
        .filename()
        .to_string();
    h.metadata.heal(Op::Set).await;
    h.objects.heal(Op::Delete).await;

    // Dangling metadata: blob deleted, metadata delete fails
    let dangling = ingest(&h).await.unwrap();
    h.metadata.fail(Op::Delete, connection_error()).await;
    assert!(!h.service.delete(&dangling).await.unwrap().is_clean());
    h.metadata.heal(Op::Delete).await;

    assert_eq!(h.service.inconsistency_count(), 2);

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    assert_eq!(report.orphan_keys(), vec![orphan.as_str()]);
    assert_eq!(report.dangling_metadata, vec![dangling.clone()]);

    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, repair_all()).await;
    assert_eq!(summary.orphans_deleted, 1);
    assert_eq!(summary.dangling_deleted, 1);
    assert_eq!(summary.skipped, 0);
    assert!(summary.failures.is_empty());

    let after = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    assert!(after.is_consistent());
    assert!(h.objects.inner().get(&kept).await.is_some());
    assert!(h.objects.inner().get(&orphan).await.is_none());
}

#[tokio::test]
async fn test_repair_respects_options() {
    let h = Harness::new();
    h.objects
        .inner()
        .put("orphan.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();
    h.metadata.inner().set("dangling.jpeg", &document("dangling.jpeg")).await.unwrap();

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    let options = RepairOptions {
        delete_dangling: false,
        ..repair_all()
    };
    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, options).await;

    assert_eq!(summary.orphans_deleted, 1);
    assert_eq!(summary.dangling_deleted, 0);
    assert!(h.metadata.inner().get("dangling.jpeg").await.unwrap().is_some());
}

#[tokio::test]
async fn test_repair_skips_findings_that_healed() {
    let h = Harness::new();
    h.objects
        .inner()
        .put("late.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();
    h.metadata.inner().set("slow.jpeg", &document("slow.jpeg")).await.unwrap();

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    assert_eq!(report.warnings().len(), 2);

    // An in-flight ingest completes between the scan and the repair
    h.metadata.inner().set("late.jpeg", &document("late.jpeg")).await.unwrap();
    h.objects
        .inner()
        .put("slow.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();

    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, repair_all()).await;

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.orphans_deleted + summary.dangling_deleted, 0);
    assert!(reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT)
        .await
        .unwrap()
        .is_consistent());
}

#[tokio::test]
async fn test_repair_collects_failures() {
    let h = Harness::new();
    h.objects
        .inner()
        .put("a.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();
    h.objects
        .inner()
        .put("b.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    h.objects.fail(Op::Delete, connection_error()).await;

    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, repair_all()).await;

    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.orphans_deleted, 0);
}

#[tokio::test]
async fn test_scan_failure_is_reported() {
    let h = Harness::new();
    h.metadata.fail(Op::List, connection_error()).await;

    assert!(reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.is_err());
}

#[tokio::test]
async fn test_repair_keeps_recent_orphans() {
    let h = Harness::new();

    // Looks like an ingestion that has not written its metadata yet
    h.objects
        .inner()
        .put("fresh.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();

    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();
    assert_eq!(report.orphan_keys(), vec!["fresh.jpeg"]);
    assert!(report.orphan_blobs[0].last_modified.is_some());
    h.log.clear().await;

    let options = RepairOptions {
        min_orphan_age: Duration::from_secs(60),
        ..repair_all()
    };
    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, options).await;

    assert_eq!(summary.too_recent, 1);
    assert_eq!(summary.orphans_deleted, 0);
    assert!(h.log.entries().await.is_empty());
    assert!(h.objects.inner().get("fresh.jpeg").await.is_some());
}

#[tokio::test]
async fn test_stalled_store_times_out_scan_and_repair() {
    let h = Harness::new();
    h.objects
        .inner()
        .put("a.jpeg", Bytes::from_static(b"x"), "image/jpeg", true)
        .await
        .unwrap();
    let report = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT).await.unwrap();

    h.metadata.fail(Op::Get, Fault::Stall).await;
    let summary = repair(h.objects.as_ref(), h.metadata.as_ref(), &report, repair_all()).await;
    assert_eq!(summary.failures.len(), 1);
    assert!(h.objects.inner().get("a.jpeg").await.is_some());

    h.metadata.fail(Op::List, Fault::Stall).await;
    let err = reconcile(h.objects.as_ref(), h.metadata.as_ref(), LIMIT)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Timeout { .. }));
}
