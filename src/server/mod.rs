//! HTTP server layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │        POST /images   GET|DELETE /images/{key}   /health        │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │  handlers   │  │     auth     │  │        routes          │  │
//! │  │ (multipart) │  │ (bearer/HMAC)│  │  (router config)       │  │
//! │  └─────────────┘  └──────────────┘  └────────────────────────┘  │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 ▼
//!                       pipeline::ImageService
//! ```

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::{auth_middleware, bearer_token, AuthError, AuthVerifier, HmacTokenVerifier, Principal};
pub use handlers::{
    delete_handler, health_handler, record_handler, upload_handler, url_handler, AppState,
    DeleteResponse, ErrorResponse, HealthResponse, CONTENT_FIELD, METADATA_FIELD,
};
pub use routes::{create_dev_router, create_router, RouterConfig, DEFAULT_MAX_UPLOAD_BYTES};
