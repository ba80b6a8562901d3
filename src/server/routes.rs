//! Router configuration for the image API.
//!
//! # Route Structure
//!
//! ```text
//! /health                        - Health check (public)
//! POST   /images                 - Upload (protected)
//! GET    /images/{key}           - Public URL (protected)
//! GET    /images/{key}/record    - Stored record (protected)
//! DELETE /images/{filename}      - Delete (protected)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use image_ingest::pipeline::ImageService;
//! use image_ingest::server::{create_router, RouterConfig};
//!
//! let service = ImageService::new(objects, metadata);
//! let config = RouterConfig::new("my-secret-key")
//!     .with_cors_origins(vec!["https://example.com".to_string()]);
//!
//! let router = create_router(service, config);
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! axum::serve(listener, router).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, AuthVerifier, HmacTokenVerifier};
use super::handlers::{
    delete_handler, health_handler, record_handler, upload_handler, url_handler, AppState,
};
use crate::pipeline::ImageService;
use crate::store::{MetadataStore, ObjectStore};

/// Default upper bound on a request body.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration for the HTTP router.
#[derive(Clone)]
pub struct RouterConfig {
    /// Token verifier for `/images` routes (None = authentication disabled)
    pub verifier: Option<Arc<dyn AuthVerifier>>,

    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Maximum accepted request body size in bytes
    pub max_upload_bytes: usize,

    /// Whether to enable request tracing
    pub enable_tracing: bool,
}

impl RouterConfig {
    /// Create a configuration verifying HMAC tokens signed with `auth_secret`.
    ///
    /// By default:
    /// - Authentication is enabled
    /// - CORS allows any origin
    /// - Uploads are limited to 20 MiB
    /// - Tracing is enabled
    pub fn new(auth_secret: impl AsRef<[u8]>) -> Self {
        Self::with_verifier(Arc::new(HmacTokenVerifier::new(auth_secret)))
    }

    /// Create a configuration using a custom verifier.
    pub fn with_verifier(verifier: Arc<dyn AuthVerifier>) -> Self {
        Self {
            verifier: Some(verifier),
            cors_origins: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            enable_tracing: true,
        }
    }

    /// Create a configuration with authentication disabled.
    ///
    /// Uploads then carry no `authorId`. Development and testing only.
    pub fn without_auth() -> Self {
        Self {
            verifier: None,
            cors_origins: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            enable_tracing: true,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Set specific allowed CORS origins.
    ///
    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    /// Allow any CORS origin.
    pub fn with_cors_any_origin(mut self) -> Self {
        self.cors_origins = None;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Enable or disable request tracing.
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

/// Create the main application router.
///
/// Builds the `/images` routes behind the bearer-token middleware (when a
/// verifier is configured), the public health check, CORS, the body size
/// limit and optional request tracing.
pub fn create_router<O, M>(service: ImageService<O, M>, config: RouterConfig) -> Router
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    let app_state = AppState::new(service);
    let cors = build_cors_layer(&config);

    let image_routes = Router::new()
        .route("/images", post(upload_handler::<O, M>))
        .route("/images/{key}", get(url_handler::<O, M>).delete(delete_handler::<O, M>))
        .route("/images/{key}/record", get(record_handler::<O, M>))
        .with_state(app_state.clone());

    let image_routes = match config.verifier.clone() {
        Some(verifier) => {
            image_routes.layer(middleware::from_fn_with_state(verifier, auth_middleware))
        }
        None => image_routes,
    };

    let public_routes = Router::new()
        .route("/health", get(health_handler::<O, M>))
        .with_state(app_state);

    let router = Router::new()
        .merge(image_routes)
        .merge(public_routes)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Build the CORS layer based on configuration.
fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed_origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed_origins)
        }
    }
}

/// Create a development router with authentication disabled.
pub fn create_dev_router<O, M>(service: ImageService<O, M>) -> Router
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    create_router(service, RouterConfig::without_auth())
}

// =============================================================================
// Tests
// =============================================================================
