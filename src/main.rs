mod blob_store;
mod config;
mod error;
mod orchestrator;
mod outcome;
mod record_store;
mod scanner;

use anyhow::{Context, Result};
use blob_store::S3BlobStore;
use clap::Parser;
use config::Config;
use orchestrator::UploadOrchestrator;
use record_store::PgRecordStore;
use scanner::FolderScanner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Batch-uploads per-device test folders: JSON metadata into the record
/// store, images into the blob store, with a marker file written per folder.
#[derive(Debug, Parser)]
#[command(name = "device-test-uploader", version)]
struct Cli {
    /// Root folder containing one subfolder per device test
    #[arg(default_value = ".")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        root = %cli.root.display(),
        bucket = %config.blob_store.bucket,
        "Starting batch upload"
    );

    // Initialize backend clients
    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run record store migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.blob_store)
            .await
            .context("Failed to initialize blob store")?,
    );

    let orchestrator = UploadOrchestrator::new(
        record_store,
        blob_store,
        config.upload.image_extensions.clone(),
    );

    // Discover work units; a bad root path is the only fatal condition
    let units = FolderScanner::new(&cli.root)
        .discover()
        .context("Failed to scan root folder")?;

    // One folder fully completes (metadata, images, marker) before the next
    // begins; a failed folder is reported and the loop moves on.
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for unit in &units {
        let outcome = orchestrator.process(unit).await;
        if outcome.summary.overall_success {
            succeeded += 1;
            info!(folder = %unit.name, "folder processed successfully");
        } else {
            failed += 1;
            warn!(folder = %unit.name, "folder processed with errors");
        }
    }

    let total = units.len();
    if total == 0 {
        info!("No subfolders found to process");
    } else {
        info!(
            total_folders = total,
            succeeded,
            failed,
            success_rate = %format!("{:.1}%", 100.0 * succeeded as f64 / total as f64),
            "Batch upload complete"
        );
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
