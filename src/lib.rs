//! # image-ingest
//!
//! An image ingestion service: uploads are compressed to fit a byte budget and
//! persisted across two independently failing stores, a blob store for the
//! image and a document store for its metadata.
//!
//! ## Features
//!
//! - **Size-bounded encoding**: fit-inside resize, then a capped quality search
//!   (JPEG quantisation, PNG posterisation) until the output fits
//! - **Two-store consistency**: blob-then-metadata ordering, one compensating
//!   delete on partial failure, idempotent deletion
//! - **Timeouts with resolution**: a timed-out store call is settled by checking
//!   whether it landed
//! - **Reconciliation**: offline detection and repair of orphan blobs and
//!   dangling metadata
//! - **Authentication**: HMAC-SHA256 signed bearer tokens
//!
//! ## Architecture
//!
//! - [`encode`] - Quality-search encoder and codecs
//! - [`metadata`] - Metadata documents and validation
//! - [`store`] - Object and metadata store traits, S3 and in-memory backends
//! - [`pipeline`] - Ingestion, deletion, record lookup and reconciliation
//! - [`server`] - Axum-based HTTP server and routes
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use image_ingest::{create_router, ImageService, MemoryMetadataStore, MemoryObjectStore, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ImageService::new(MemoryObjectStore::default(), MemoryMetadataStore::new());
//!     let router = create_router(service, RouterConfig::new("my-secret-key"));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod config;
pub mod encode;
pub mod error;
pub mod metadata;
pub mod pipeline;
pub mod server;
pub mod store;

// Re-export commonly used types
pub use config::{Cli, Command, ReconcileConfig, ServeConfig, StorageBackend, TokenConfig};
pub use encode::{compress_to_target, CompressionResult, CompressionTarget, OutputFormat};
pub use error::{
    ClientInputError, CompressionError, InconsistencyWarning, PipelineError, StoreError,
};
pub use metadata::{validate_metadata, validate_metadata_json, ImageMetadata, StoredImageRecord};
pub use pipeline::{DeleteOutcome, ImageService, RawImageInput, RecordLookup, ReconcileReport};
pub use server::{
    create_dev_router, create_router, AppState, AuthVerifier, ErrorResponse, HealthResponse,
    HmacTokenVerifier, Principal, RouterConfig,
};
pub use store::{
    create_s3_client, MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore,
    ObjectSummary, S3MetadataStore, S3ObjectStore,
};
