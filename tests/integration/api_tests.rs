//! HTTP API integration tests.
//!
//! Tests verify:
//! - Multipart uploads and the stored record returned for them
//! - Error mapping for client input, undecodable images and store failures
//! - URL, record and delete endpoints
//! - Health check reporting

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use image_ingest::store::ObjectStore;
use image_ingest::{create_router, RouterConfig};

use super::test_utils::{
    connection_error, create_test_jpeg, create_test_png, Harness, MultipartBuilder, Op,
};

fn router(h: &Harness) -> Router {
    create_router(h.service.clone(), RouterConfig::without_auth().with_tracing(false))
}

fn upload(content_type: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/images")
        .header("content-type", content_type)
        .body(Body::from(body))
        .unwrap()
}

fn jpeg_upload() -> Request<Body> {
    let (content_type, body) = MultipartBuilder::new()
        .file("content", "photo.jpg", "image/jpeg", &create_test_jpeg(64, 48, 85))
        .finish();
    upload(&content_type, body)
}

async fn body_json(response: Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

async fn assert_error(response: Response, status: StatusCode, error_type: &str) {
    assert_eq!(response.status(), status);
    let json = body_json(response).await;
    assert_eq!(json["error"], error_type);
    assert_eq!(json["status"], status.as_u16());
}

// =============================================================================
// Upload
// =============================================================================

#[tokio::test]
async fn test_upload_returns_created_record() {
    let h = Harness::new();

    let response = router(&h).oneshot(jpeg_upload()).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;

    let filename = json["filename"].as_str().unwrap();
    assert!(filename.ends_with(".jpeg"));
    assert_eq!(json["url"], format!("https://cdn.test/{}", filename));
    assert_eq!(json["metadata"]["filename"], filename);
    assert!(json["metadata"]["createdAt"].as_str().unwrap().ends_with('Z'));
    assert!(json["metadata"].get("authorId").is_none());

    assert!(h.objects.inner().get(filename).await.is_some());
}

#[tokio::test]
async fn test_upload_with_metadata() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .text("metadata", r#"{"groupId":"album-7","caption":"harbour"}"#)
        .file("content", "photo.png", "image/png", &create_test_png(32, 32))
        .finish();

    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert!(json["filename"].as_str().unwrap().ends_with(".png"));
    assert_eq!(json["metadata"]["groupId"], "album-7");
    assert_eq!(json["metadata"]["caption"], "harbour");
}

#[tokio::test]
async fn test_upload_ignores_unknown_fields() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .text("comment", "ignored")
        .file("content", "photo.jpg", "image/jpeg", &create_test_jpeg(16, 16, 80))
        .finish();

    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_upload_without_file() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new().text("metadata", "{}").finish();
    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "missing_file").await;
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_upload_unsupported_mime_type() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .file("content", "notes.txt", "text/plain", b"hello")
        .finish();
    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "invalid_mime_type").await;
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_upload_empty_file() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .file("content", "empty.jpg", "image/jpeg", b"")
        .finish();
    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "empty_file").await;
}

#[tokio::test]
async fn test_upload_invalid_metadata() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .text("metadata", r#"{"groupId": ["not", "a", "string"]}"#)
        .file("content", "photo.jpg", "image/jpeg", &create_test_jpeg(16, 16, 80))
        .finish();
    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_metadata");
    assert!(json["message"].as_str().unwrap().contains("groupId"));
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_upload_undecodable_image() {
    let h = Harness::new();

    let (content_type, body) = MultipartBuilder::new()
        .file("content", "broken.jpg", "image/jpeg", b"\xFF\xD8 truncated")
        .finish();
    let response = router(&h).oneshot(upload(&content_type, body)).await.unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "invalid_image").await;
    assert!(h.log.entries().await.is_empty());
}

#[tokio::test]
async fn test_upload_not_multipart() {
    let h = Harness::new();

    let response = router(&h)
        .oneshot(upload("application/json", b"{}".to_vec()))
        .await
        .unwrap();

    assert_error(response, StatusCode::BAD_REQUEST, "invalid_multipart").await;
}

#[tokio::test]
async fn test_upload_over_body_limit_is_rejected() {
    let h = Harness::new();
    let router = create_router(
        h.service.clone(),
        RouterConfig::without_auth()
            .with_tracing(false)
            .with_max_upload_bytes(1024),
    );

    let response = router
        .oneshot(upload_of_size(64 * 1024))
        .await
        .unwrap();

    assert!(response.status().is_client_error());
    assert!(h.log.entries().await.is_empty());
}

fn upload_of_size(size: usize) -> Request<Body> {
    let (content_type, body) = MultipartBuilder::new()
        .file("content", "big.jpg", "image/jpeg", &vec![0xAB; size])
        .finish();
    upload(&content_type, body)
}

#[tokio::test]
async fn test_upload_store_failure_is_server_error() {
    let h = Harness::new();
    h.metadata.fail(Op::Set, connection_error()).await;

    let response = router(&h).oneshot(jpeg_upload()).await.unwrap();

    assert_error(response, StatusCode::INTERNAL_SERVER_ERROR, "upstream_error").await;
    assert!(h.objects.inner().is_empty().await, "blob should be compensated");
}

// =============================================================================
// Lookup
// =============================================================================

#[tokio::test]
async fn test_url_endpoint_returns_public_url() {
    let h = Harness::new();

    let request = Request::builder()
        .uri("/images/abc.jpeg")
        .body(Body::empty())
        .unwrap();
    let response = router(&h).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, "https://cdn.test/abc.jpeg");
}

#[tokio::test]
async fn test_record_endpoint() {
    let h = Harness::new();
    let app = router(&h);

    let created = body_json(app.clone().oneshot(jpeg_upload()).await.unwrap()).await;
    let filename = created["filename"].as_str().unwrap().to_string();

    let record_request = |name: &str| {
        Request::builder()
            .uri(format!("/images/{}/record", name))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(record_request(&filename)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, created);

    let response = app.clone().oneshot(record_request("missing.jpeg")).await.unwrap();
    assert_error(response, StatusCode::NOT_FOUND, "not_found").await;

    h.objects.inner().delete(&filename).await.unwrap();
    let response = app.oneshot(record_request(&filename)).await.unwrap();
    assert_error(response, StatusCode::GONE, "broken_link").await;
}

// =============================================================================
// Delete
// =============================================================================

fn delete_request(name: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/images/{}", name))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_delete_endpoint_is_idempotent() {
    let h = Harness::new();
    let app = router(&h);

    let created = body_json(app.clone().oneshot(jpeg_upload()).await.unwrap()).await;
    let filename = created["filename"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = app.clone().oneshot(delete_request(&filename)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["message"], "Image deleted successfully");
        assert_eq!(json["filename"], filename.as_str());
    }

    assert!(h.objects.inner().is_empty().await);
    assert!(h.metadata.inner().is_empty().await);
}

#[tokio::test]
async fn test_delete_blob_failure_is_server_error() {
    let h = Harness::new();
    h.objects.fail(Op::Delete, connection_error()).await;

    let response = router(&h).oneshot(delete_request("a.jpeg")).await.unwrap();

    assert_error(response, StatusCode::INTERNAL_SERVER_ERROR, "upstream_error").await;
    assert_eq!(h.log.count("metadata.delete").await, 0);
}

// =============================================================================
// Health
// =============================================================================

async fn health(app: Router) -> Value {
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_health_reports_inconsistencies() {
    let h = Harness::new();
    let app = router(&h);

    let json = health(app.clone()).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["inconsistencies"], 0);

    h.metadata.fail(Op::Delete, connection_error()).await;
    let response = app.clone().oneshot(delete_request("a.jpeg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(health(app).await["inconsistencies"], 1);
}
