//! image-ingest - size-bounded image uploads backed by S3.
//!
//! This binary starts the HTTP server, mints tokens and reconciles stores.

use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_ingest::{
    config::{
        Cli, Command, ReconcileConfig, ServeConfig, StorageArgs, StorageBackend, TokenConfig,
        TokenOutputFormat,
    },
    pipeline::{reconcile, repair, ImageService},
    server::{auth::HmacTokenVerifier, create_router, RouterConfig},
    store::{
        create_s3_client, MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore,
        S3MetadataStore, S3ObjectStore,
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Token(config) => run_token(config),
        Command::Reconcile(config) => run_reconcile(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let target = match config.compression_target() {
        Ok(target) => target,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("image-ingest v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!(
        "  Compression: max {}px, target {} bytes, quality {}..{} step {}",
        target.max_dimension_px(),
        target.target_size_bytes(),
        target.start_quality(),
        target.quality_floor(),
        target.quality_step()
    );
    info!("  Store timeout: {}s", config.store_timeout);

    if config.auth_enabled {
        info!("  Auth: enabled");
    } else {
        warn!("  Auth: DISABLED - all endpoints are publicly accessible");
        warn!("        Enable for production: --auth-enabled=true --auth-secret=<secret>");
    }

    match config.storage.storage {
        StorageBackend::Memory => {
            warn!("  Storage: in-memory - images are lost on exit");
            let service = ImageService::new(MemoryObjectStore::default(), MemoryMetadataStore::new());
            serve(service.with_target(target), &config).await
        }
        StorageBackend::S3 => {
            let Some((objects, metadata)) = connect_s3(&config.storage).await else {
                return ExitCode::FAILURE;
            };
            let service = ImageService::new(objects, metadata);
            serve(service.with_target(target), &config).await
        }
    }
}

async fn serve<O, M>(service: ImageService<O, M>, config: &ServeConfig) -> ExitCode
where
    O: ObjectStore + 'static,
    M: MetadataStore + 'static,
{
    let service = service.with_store_timeout(config.store_timeout());
    let router = create_router(service, build_router_config(config));
    let addr = config.bind_address();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    if config.auth_enabled {
        info!("    image-ingest token --subject <user>");
        info!(
            "    curl -H 'Authorization: Bearer <token>' -F content=@photo.jpg http://{}/images",
            addr
        );
    } else {
        info!("    curl -F content=@photo.jpg http://{}/images", addr);
    }
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}

/// Resolve when the process receives Ctrl-C.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received; draining in-flight requests");
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = if config.auth_enabled {
        RouterConfig::new(config.auth_secret_or_empty())
    } else {
        RouterConfig::without_auth()
    };

    router_config = router_config.with_max_upload_bytes(config.max_upload_size);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}

/// Create the S3 stores and check both buckets are reachable.
async fn connect_s3(storage: &StorageArgs) -> Option<(S3ObjectStore, S3MetadataStore)> {
    let bucket = storage.bucket();
    let metadata_bucket = storage.metadata_bucket();

    info!("  S3 bucket: {}", bucket);
    if !storage.shares_bucket() {
        info!("  Metadata bucket: {}", metadata_bucket);
    }
    info!("  Metadata prefix: {}", storage.metadata_prefix);
    if let Some(ref endpoint) = storage.s3_endpoint {
        info!("  S3 endpoint: {}", endpoint);
    }
    info!("  S3 region: {}", storage.s3_region);

    let client = create_s3_client(storage.s3_endpoint.as_deref(), &storage.s3_region).await;

    info!("Connecting to S3...");
    for name in [bucket, metadata_bucket] {
        if let Err(e) = test_s3_connection(&client, name).await {
            error!("  Failed to connect to S3: {}", e);
            error!("");
            error!("  Please check:");
            error!("    - Your AWS credentials are configured correctly");
            error!("    - The bucket '{}' exists and is accessible", name);
            error!("    - The S3 endpoint is correct (if using MinIO/custom S3)");
            return None;
        }
    }
    info!("  Connected successfully");

    let mut objects = S3ObjectStore::new(client.clone(), bucket, storage.public_base_url());
    if storage.shares_bucket() {
        objects = objects.with_ignored_prefix(storage.metadata_prefix.clone());
    }
    let metadata = S3MetadataStore::new(client, metadata_bucket, storage.metadata_prefix.clone());

    Some((objects, metadata))
}

/// Test S3 connectivity with a one-key listing.
async fn test_s3_connection(client: &aws_sdk_s3::Client, bucket: &str) -> Result<(), String> {
    client
        .list_objects_v2()
        .bucket(bucket)
        .max_keys(1)
        .send()
        .await
        .map(|_| ())
        .map_err(|e| format!("{}", aws_sdk_s3::error::DisplayErrorContext(&e)))
}

// =============================================================================
// Token Command
// =============================================================================

fn run_token(config: TokenConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let verifier = HmacTokenVerifier::new(&config.secret);
    let token = verifier.sign(&config.subject, Duration::from_secs(config.ttl));

    match config.format {
        TokenOutputFormat::Token => {
            println!("{}", token);
        }
        TokenOutputFormat::Json => {
            let principal = match verifier.verify_token(&token) {
                Ok(principal) => principal,
                Err(e) => {
                    eprintln!("Error: freshly minted token did not verify: {}", e);
                    return ExitCode::FAILURE;
                }
            };

            let json = serde_json::json!({
                "token": token,
                "subject": principal.subject,
                "expires_at": principal.expires_at,
                "ttl": config.ttl,
            });
            match serde_json::to_string_pretty(&json) {
                Ok(out) => println!("{}", out),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Reconcile Command
// =============================================================================

async fn run_reconcile(config: ReconcileConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let Some((objects, metadata)) = connect_s3(&config.storage).await else {
        return ExitCode::FAILURE;
    };
    reconcile_stores(&objects, &metadata, &config).await
}

async fn reconcile_stores<O, M>(objects: &O, metadata: &M, config: &ReconcileConfig) -> ExitCode
where
    O: ObjectStore,
    M: MetadataStore,
{
    let report = match reconcile(objects, metadata, config.store_timeout()).await {
        Ok(report) => report,
        Err(e) => {
            error!("Reconciliation scan failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let options = config.repair_options();
    let summary = if options.delete_orphans || options.delete_dangling {
        Some(repair(objects, metadata, &report, options).await)
    } else {
        None
    };

    if config.json {
        let json = serde_json::json!({ "report": report, "repair": summary });
        match serde_json::to_string_pretty(&json) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Reconciliation Report");
        println!("═════════════════════");
        println!("Blobs scanned:      {}", report.blobs_scanned);
        println!("Documents scanned:  {}", report.documents_scanned);
        println!();
        println!("Orphan blobs ({}):", report.orphan_blobs.len());
        for orphan in &report.orphan_blobs {
            match orphan.last_modified {
                Some(modified) => println!("  {}  (written {})", orphan.key, modified.to_rfc3339()),
                None => println!("  {}", orphan.key),
            }
        }
        println!("Dangling metadata ({}):", report.dangling_metadata.len());
        for id in &report.dangling_metadata {
            println!("  {}", id);
        }

        if let Some(ref summary) = summary {
            println!();
            println!("Repair:");
            println!("  Orphans deleted:   {}", summary.orphans_deleted);
            println!("  Dangling deleted:  {}", summary.dangling_deleted);
            println!("  Skipped (healed):  {}", summary.skipped);
            println!("  Too recent:        {}", summary.too_recent);
            for failure in &summary.failures {
                println!("  ✗ {}", failure);
            }
        }
    }

    let unresolved = (!report.orphan_blobs.is_empty() && !options.delete_orphans)
        || (!report.dangling_metadata.is_empty() && !options.delete_dangling)
        || summary
            .as_ref()
            .is_some_and(|s| !s.failures.is_empty() || s.too_recent > 0);

    if unresolved {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "image_ingest=debug,tower_http=debug"
    } else {
        "image_ingest=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
