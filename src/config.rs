//! Configuration management.
//!
//! The binary has three subcommands:
//!
//! - `serve` - run the HTTP API
//! - `token` - mint a bearer token for a user
//! - `reconcile` - scan both stores for orphan blobs and dangling metadata
//!
//! Every option can also be set through an environment variable with the
//! `INGEST_` prefix.
//!
//! # Environment Variables
//!
//! - `INGEST_HOST` / `INGEST_PORT` - Server bind address (default: 0.0.0.0:3000)
//! - `INGEST_STORAGE` - `s3` or `memory` (default: s3)
//! - `INGEST_S3_BUCKET` - Bucket for image blobs (required for s3)
//! - `INGEST_S3_ENDPOINT` - Custom endpoint for S3-compatible services
//! - `INGEST_S3_REGION` - AWS region (default: us-east-1)
//! - `INGEST_METADATA_BUCKET` - Bucket for metadata documents (default: image bucket)
//! - `INGEST_METADATA_PREFIX` - Key prefix for metadata documents (default: metadata/)
//! - `INGEST_PUBLIC_BASE_URL` - Base of public image URLs (default: bucket URL)
//! - `INGEST_AUTH_SECRET` - HMAC secret for bearer tokens
//! - `INGEST_AUTH_ENABLED` - Require bearer tokens (default: true)
//! - `INGEST_MAX_DIMENSION` - Longest side after resize (default: 1024)
//! - `INGEST_TARGET_SIZE` - Compressed size budget, e.g. `300KB` (default: 3MB)
//! - `INGEST_START_QUALITY` / `INGEST_QUALITY_FLOOR` / `INGEST_QUALITY_STEP`
//! - `INGEST_STORE_TIMEOUT` - Seconds allowed per store call (default: 10)
//! - `INGEST_MAX_UPLOAD_SIZE` - Request body limit (default: 20MB)
//! - `INGEST_CORS_ORIGINS` - Comma-separated allowed origins
//! - `INGEST_MIN_ORPHAN_AGE` - Seconds before `reconcile` may delete an orphan blob (default: 600)

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::encode::{
    CompressionTarget, DEFAULT_MAX_DIMENSION, DEFAULT_QUALITY_FLOOR, DEFAULT_QUALITY_STEP,
    DEFAULT_START_QUALITY,
};
use crate::pipeline::RepairOptions;
use crate::store::default_public_base_url;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default AWS region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default key prefix for metadata documents.
pub const DEFAULT_METADATA_PREFIX: &str = "metadata/";

/// Default compressed size budget.
pub const DEFAULT_TARGET_SIZE: &str = "3MB";

/// Default request body limit.
pub const DEFAULT_MAX_UPLOAD_SIZE: &str = "20MB";

/// Default per-call store timeout in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default minimum age in seconds of an orphan blob `reconcile` may delete.
pub const DEFAULT_MIN_ORPHAN_AGE_SECS: u64 = 600;

/// Default token lifetime in seconds (1 hour).
pub const DEFAULT_TOKEN_TTL: u64 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// image-ingest - size-bounded image uploads backed by S3.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API
    Serve(ServeConfig),

    /// Mint a bearer token for a user
    Token(TokenConfig),

    /// Find (and optionally remove) orphan blobs and dangling metadata
    Reconcile(ReconcileConfig),
}

/// Which store implementations to use.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// S3 or an S3-compatible service
    #[default]
    S3,

    /// In-process maps; data is lost on exit
    Memory,
}

// =============================================================================
// Storage Arguments
// =============================================================================

/// Storage options shared by `serve` and `reconcile`.
#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Storage backend.
    #[arg(long, value_enum, default_value_t = StorageBackend::S3, env = "INGEST_STORAGE")]
    pub storage: StorageBackend,

    /// S3 bucket holding image blobs.
    #[arg(long, env = "INGEST_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "INGEST_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for S3.
    #[arg(long, default_value = DEFAULT_REGION, env = "INGEST_S3_REGION")]
    pub s3_region: String,

    /// Bucket holding metadata documents (defaults to the image bucket).
    #[arg(long, env = "INGEST_METADATA_BUCKET")]
    pub metadata_bucket: Option<String>,

    /// Key prefix for metadata documents.
    #[arg(long, default_value = DEFAULT_METADATA_PREFIX, env = "INGEST_METADATA_PREFIX")]
    pub metadata_prefix: String,

    /// Base URL of public image links (defaults to the bucket's URL).
    #[arg(long, env = "INGEST_PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,
}

impl StorageArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.storage == StorageBackend::Memory {
            return Ok(());
        }

        if self.bucket().is_empty() {
            return Err(
                "S3 bucket name is required. Set --s3-bucket or INGEST_S3_BUCKET".to_string(),
            );
        }

        if self.shares_bucket() && self.metadata_prefix.is_empty() {
            return Err(
                "metadata_prefix must not be empty when metadata shares the image bucket"
                    .to_string(),
            );
        }

        if let Some(base) = &self.public_base_url {
            url::Url::parse(base).map_err(|e| format!("Invalid public_base_url '{}': {}", base, e))?;
        }

        Ok(())
    }

    /// The image bucket (empty if unset).
    pub fn bucket(&self) -> &str {
        self.s3_bucket.as_deref().unwrap_or("")
    }

    /// The metadata bucket, falling back to the image bucket.
    pub fn metadata_bucket(&self) -> &str {
        self.metadata_bucket.as_deref().unwrap_or_else(|| self.bucket())
    }

    /// Whether metadata documents live in the image bucket.
    pub fn shares_bucket(&self) -> bool {
        self.metadata_bucket() == self.bucket()
    }

    /// Base of public image URLs.
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.clone(),
            None => default_public_base_url(
                self.bucket(),
                &self.s3_region,
                self.s3_endpoint.as_deref(),
            ),
        }
    }
}

// =============================================================================
// Serve Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "INGEST_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "INGEST_PORT")]
    pub port: u16,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Secret key for HMAC-SHA256 bearer tokens.
    #[arg(long, env = "INGEST_AUTH_SECRET")]
    pub auth_secret: Option<String>,

    /// Require bearer tokens on /images routes.
    ///
    /// WARNING: Only disable authentication in development/testing.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, env = "INGEST_AUTH_ENABLED")]
    pub auth_enabled: bool,

    /// Longest side, in pixels, of a stored image.
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION, env = "INGEST_MAX_DIMENSION")]
    pub max_dimension: u32,

    /// Compressed size budget (e.g. "300KB", "3MB").
    #[arg(long, default_value = DEFAULT_TARGET_SIZE, value_parser = parse_size, env = "INGEST_TARGET_SIZE")]
    pub target_size: usize,

    /// Encoder quality of the first attempt (1-100).
    #[arg(long, default_value_t = DEFAULT_START_QUALITY, env = "INGEST_START_QUALITY")]
    pub start_quality: u8,

    /// Lowest encoder quality tried (1-100).
    #[arg(long, default_value_t = DEFAULT_QUALITY_FLOOR, env = "INGEST_QUALITY_FLOOR")]
    pub quality_floor: u8,

    /// Quality decrement between attempts.
    #[arg(long, default_value_t = DEFAULT_QUALITY_STEP, env = "INGEST_QUALITY_STEP")]
    pub quality_step: u8,

    /// Seconds allowed for each store call.
    #[arg(long, default_value_t = DEFAULT_STORE_TIMEOUT_SECS, env = "INGEST_STORE_TIMEOUT")]
    pub store_timeout: u64,

    /// Request body limit (e.g. "20MB").
    #[arg(long, default_value = DEFAULT_MAX_UPLOAD_SIZE, value_parser = parse_size, env = "INGEST_MAX_UPLOAD_SIZE")]
    pub max_upload_size: usize,

    /// Allowed CORS origins (comma-separated). Any origin if unset.
    #[arg(long, env = "INGEST_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_enabled && self.auth_secret.as_deref().map_or(true, str::is_empty) {
            return Err(
                "Authentication is enabled but no secret provided. \
                 Set --auth-secret or INGEST_AUTH_SECRET, or disable auth with --auth-enabled=false"
                    .to_string(),
            );
        }

        self.storage.validate()?;
        self.compression_target()?;

        if self.store_timeout == 0 {
            return Err("store_timeout must be greater than 0".to_string());
        }
        if self.max_upload_size == 0 {
            return Err("max_upload_size must be greater than 0".to_string());
        }

        Ok(())
    }

    /// The compression target described by the quality options.
    pub fn compression_target(&self) -> Result<CompressionTarget, String> {
        CompressionTarget::new(
            self.max_dimension,
            self.target_size,
            self.start_quality,
            self.quality_floor,
            self.quality_step,
        )
        .map_err(|e| e.to_string())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout)
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The auth secret, or "" if unset (call validate() first).
    pub fn auth_secret_or_empty(&self) -> &str {
        self.auth_secret.as_deref().unwrap_or("")
    }
}

// =============================================================================
// Token Command
// =============================================================================

/// Output format of the `token` command.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenOutputFormat {
    /// The bare token
    #[default]
    Token,

    /// Token, subject and expiry as JSON
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct TokenConfig {
    /// User identifier the token is issued to.
    #[arg(long)]
    pub subject: String,

    /// Secret key (must match the server's).
    #[arg(long, env = "INGEST_AUTH_SECRET")]
    pub secret: String,

    /// Token lifetime in seconds.
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL)]
    pub ttl: u64,

    /// Output format.
    #[arg(long, value_enum, default_value_t = TokenOutputFormat::Token)]
    pub format: TokenOutputFormat,
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.secret.is_empty() {
            return Err("Secret must not be empty".to_string());
        }
        if self.subject.trim().is_empty() {
            return Err("Subject must not be empty".to_string());
        }
        if self.ttl == 0 {
            return Err("ttl must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Reconcile Command
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct ReconcileConfig {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Delete blobs that have no metadata document.
    #[arg(long, default_value_t = false)]
    pub delete_orphans: bool,

    /// Delete metadata documents whose blob is missing.
    #[arg(long, default_value_t = false)]
    pub delete_dangling: bool,

    /// Seconds since its last write before an orphan blob may be deleted.
    /// Must exceed the longest an upload can take on the serving side.
    #[arg(long, default_value_t = DEFAULT_MIN_ORPHAN_AGE_SECS, env = "INGEST_MIN_ORPHAN_AGE")]
    pub min_orphan_age: u64,

    /// Seconds allowed for each store call.
    #[arg(long, default_value_t = DEFAULT_STORE_TIMEOUT_SECS, env = "INGEST_STORE_TIMEOUT")]
    pub store_timeout: u64,

    /// Print the report as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.storage.storage == StorageBackend::Memory {
            return Err(
                "reconcile needs persistent storage; in-memory stores do not outlive the server"
                    .to_string(),
            );
        }

        if self.store_timeout == 0 {
            return Err("store_timeout must be greater than 0".to_string());
        }

        self.storage.validate()
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout)
    }

    /// Repair behaviour selected by the flags.
    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions {
            delete_orphans: self.delete_orphans,
            delete_dangling: self.delete_dangling,
            min_orphan_age: Duration::from_secs(self.min_orphan_age),
            store_timeout: self.store_timeout(),
        }
    }
}

// =============================================================================
// Size Parsing
// =============================================================================

/// Parse a human-readable byte size.
///
/// Accepts a plain number of bytes or a number followed by `B`, `K`/`KB`/`KiB`,
/// `M`/`MB`/`MiB` or `G`/`GB`/`GiB` (case-insensitive). Units are binary:
/// `300KB` is 307200 bytes.
pub fn parse_size(input: &str) -> Result<usize, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);

    let value: usize = digits
        .parse()
        .map_err(|_| format!("Invalid size '{}': expected a number", input))?;

    let multiplier: usize = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        other => return Err(format!("Invalid size '{}': unknown unit '{}'", input, other)),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Invalid size '{}': too large", input))
}

// =============================================================================
// Tests
// =============================================================================
