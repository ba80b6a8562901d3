//! Bearer token authentication.
//!
//! Every `/images` route requires `Authorization: Bearer <token>`. The
//! middleware hands the token to an [`AuthVerifier`] and stores the resulting
//! [`Principal`] in the request extensions, where handlers read the author id.
//!
//! # Token Scheme
//!
//! [`HmacTokenVerifier`] accepts self-contained signed tokens:
//!
//! ```text
//! token     = "{subject}.{expiry}.{signature}"
//! signature = hex(HMAC-SHA256(secret_key, "{subject}.{expiry}"))
//! ```
//!
//! `expiry` is a Unix timestamp in seconds. The subject may itself contain
//! dots; the token is split from the right.
//!
//! # Security Properties
//!
//! - **Subject binding**: the signature covers subject and expiry
//! - **Time-limited**: tokens expire
//! - **Constant-time comparison**: signatures are compared with `subtle`
//!
//! # Example
//!
//! ```rust
//! use image_ingest::server::auth::HmacTokenVerifier;
//! use std::time::Duration;
//!
//! let verifier = HmacTokenVerifier::new("my-secret-key");
//! let token = verifier.sign("user-42", Duration::from_secs(3600));
//!
//! let principal = verifier.verify_token(&token).unwrap();
//! assert_eq!(principal.subject, "user-42");
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::handlers::ErrorResponse;

// =============================================================================
// Types
// =============================================================================

/// HMAC-SHA256 type alias
type HmacSha256 = Hmac<Sha256>;

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Stable user identifier, recorded as the image's `authorId`
    pub subject: String,

    /// Token expiry (Unix epoch seconds)
    pub expires_at: u64,
}

/// Authentication error types.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// No `Authorization` header, or not a bearer credential
    MissingToken,

    /// Token is not `{subject}.{expiry}.{signature}`
    MalformedToken,

    /// Token has expired
    Expired {
        /// When the token expired
        expired_at: u64,
        /// Current time
        current_time: u64,
    },

    /// Signature does not match
    InvalidSignature,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing bearer token"),
            AuthError::MalformedToken => write!(f, "Malformed bearer token"),
            AuthError::Expired {
                expired_at,
                current_time,
            } => write!(
                f,
                "Token expired at {} (current time: {})",
                expired_at, current_time
            ),
            AuthError::InvalidSignature => write!(f, "Invalid token signature"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::UNAUTHORIZED;
        let error_type = match &self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedToken => "malformed_token",
            AuthError::Expired { .. } => "token_expired",
            AuthError::InvalidSignature => "invalid_signature",
        };
        let message = self.to_string();

        // A bad signature may be a forgery attempt; the rest is routine
        match &self {
            AuthError::InvalidSignature => {
                warn!(
                    error_type = error_type,
                    status = status.as_u16(),
                    "Authentication failed: {}",
                    message
                );
            }
            _ => {
                debug!(
                    error_type = error_type,
                    status = status.as_u16(),
                    "Authentication failed: {}",
                    message
                );
            }
        }

        let error_response = ErrorResponse::with_status(error_type, message, status);
        (
            status,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(error_response),
        )
            .into_response()
    }
}

// =============================================================================
// Verifier Trait
// =============================================================================

/// Resolves a bearer token to a principal.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

// =============================================================================
// HMAC Tokens
// =============================================================================

/// Issues and verifies HMAC-SHA256 signed bearer tokens.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    /// Secret key for HMAC computation
    secret_key: Vec<u8>,
}

impl HmacTokenVerifier {
    /// Create a verifier with the given secret key.
    ///
    /// The key should be at least 32 bytes.
    pub fn new(secret_key: impl AsRef<[u8]>) -> Self {
        Self {
            secret_key: secret_key.as_ref().to_vec(),
        }
    }

    /// Issue a token for `subject` valid for `ttl`.
    pub fn sign(&self, subject: &str, ttl: Duration) -> String {
        self.sign_with_expiry(subject, unix_now().saturating_add(ttl.as_secs()))
    }

    /// Issue a token for `subject` expiring at `expiry` (Unix seconds).
    pub fn sign_with_expiry(&self, subject: &str, expiry: u64) -> String {
        let signature = self.compute_signature(subject, expiry);
        format!("{}.{}.{}", subject, expiry, signature)
    }

    /// Check a token's shape, expiry and signature.
    pub fn verify_token(&self, token: &str) -> Result<Principal, AuthError> {
        let mut parts = token.rsplitn(3, '.');
        let signature = parts.next().ok_or(AuthError::MalformedToken)?;
        let expiry = parts.next().ok_or(AuthError::MalformedToken)?;
        let subject = parts.next().ok_or(AuthError::MalformedToken)?;

        if subject.is_empty() {
            return Err(AuthError::MalformedToken);
        }
        let expiry: u64 = expiry.parse().map_err(|_| AuthError::MalformedToken)?;

        // Check expiry first
        let current_time = unix_now();
        if current_time > expiry {
            return Err(AuthError::Expired {
                expired_at: expiry,
                current_time,
            });
        }

        let provided = hex::decode(signature).map_err(|_| AuthError::MalformedToken)?;
        let expected = self.compute_raw_signature(subject, expiry);

        if provided.ct_eq(&expected).into() {
            Ok(Principal {
                subject: subject.to_string(),
                expires_at: expiry,
            })
        } else {
            Err(AuthError::InvalidSignature)
        }
    }

    fn compute_signature(&self, subject: &str, expiry: u64) -> String {
        hex::encode(self.compute_raw_signature(subject, expiry))
    }

    fn compute_raw_signature(&self, subject: &str, expiry: u64) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret_key).expect("HMAC can take key of any size");
        mac.update(format!("{}.{}", subject, expiry).as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

#[async_trait]
impl AuthVerifier for HmacTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.verify_token(token)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Extract the credential from an `Authorization: Bearer …` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedToken)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MissingToken);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    Ok(token)
}

// =============================================================================
// Axum Middleware
// =============================================================================

/// Axum middleware requiring a valid bearer token.
///
/// On success the [`Principal`] is inserted into the request extensions.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use axum::{Router, middleware};
/// use image_ingest::server::auth::{auth_middleware, AuthVerifier, HmacTokenVerifier};
///
/// let verifier: Arc<dyn AuthVerifier> = Arc::new(HmacTokenVerifier::new("secret-key"));
/// let app = Router::new()
///     .route("/images", post(upload_handler))
///     .layer(middleware::from_fn_with_state(verifier, auth_middleware));
/// ```
pub async fn auth_middleware(
    State(verifier): State<Arc<dyn AuthVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = bearer_token(request.headers())?.to_string();
    let principal = verifier.verify(&token).await?;

    debug!(subject = %principal.subject, "Authenticated request");
    request.extensions_mut().insert(principal);

    Ok(next.run(request).await)
}

// =============================================================================
// Tests
// =============================================================================
