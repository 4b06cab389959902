//! # tally-worker
//!
//! Runs one pass of a tally job against a `SQLite` document store and a
//! directory-backed blob store, prints the run report as JSON and exits.
//!
//! ## Usage
//!
//! ```bash
//! # Fold new log events into the summaries (every few minutes)
//! tally-worker --database tally.db --blob-root /srv/blobs aggregate
//!
//! # Rebuild the summaries from the buckets (daily or on demand)
//! tally-worker --database tally.db --blob-root /srv/blobs reconcile
//!
//! # Drop deleted files and expired log events
//! tally-worker --database tally.db --blob-root /srv/blobs purge
//!
//! # Check one address without writing anything
//! tally-worker --database tally.db --blob-root /srv/blobs audit --address abc
//! ```
//!
//! The exit status is 0 when the run succeeds and 1 when it fails. An audit
//! that finds inconsistencies still succeeds.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use tally_core::{
    Address, BlobStore, DocumentStore, LocalBlobStore, LogFormat, SqliteDocumentStore,
    init_logging,
};
use tally_engine::{AddressAuditor, AggregationEngine, EngineConfig, Purger, ReconciliationEngine};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Tally batch worker.
#[derive(Debug, Parser)]
#[command(name = "tally-worker")]
#[command(about = "Keeps file and address summaries in step with the file log")]
#[command(version)]
struct Args {
    /// Path of the `SQLite` database holding log events and summaries.
    #[arg(long, env = "TALLY_DATABASE", global = true, default_value = "tally.db")]
    database: PathBuf,

    /// Root directory of the blob buckets (one subdirectory per bucket).
    #[arg(long, env = "TALLY_BLOB_ROOT", global = true, default_value = "blobs")]
    blob_root: PathBuf,

    /// Bucket holding live objects.
    #[arg(long, env = "TALLY_PRIMARY_BUCKET", global = true, default_value = "primary")]
    primary_bucket: String,

    /// Bucket holding backup copies.
    #[arg(long, env = "TALLY_BACKUP_BUCKET", global = true, default_value = "backup")]
    backup_bucket: String,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "TALLY_LOG_FORMAT", global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Maximum log events per aggregation run.
    #[arg(long, env = "TALLY_FETCH_LIMIT", global = true)]
    fetch_limit: Option<usize>,

    /// Rows written per transaction.
    #[arg(long, env = "TALLY_WRITE_BATCH_SIZE", global = true)]
    write_batch_size: Option<usize>,

    /// Minimum keys kept in each checkpoint.
    #[arg(long, env = "TALLY_MIN_RETAINED_KEYS", global = true)]
    min_retained_keys: Option<usize>,

    /// Log events snapshotted by reconciliation.
    #[arg(long, env = "TALLY_SNAPSHOT_SIZE", global = true)]
    snapshot_size: Option<usize>,

    /// Age in days after which log events are purged.
    #[arg(long, env = "TALLY_LOG_RETENTION_DAYS", global = true)]
    log_retention_days: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fold new log events into the summaries.
    Aggregate,

    /// Rebuild the summaries from the primary and backup buckets.
    Reconcile,

    /// Remove deleted files and expired log events.
    Purge,

    /// Compare one address's summaries with its objects.
    Audit {
        /// Address to audit.
        #[arg(long)]
        address: String,
    },
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            fetch_limit: self.fetch_limit.unwrap_or(defaults.fetch_limit),
            write_batch_size: self.write_batch_size.unwrap_or(defaults.write_batch_size),
            min_retained_keys: self.min_retained_keys.unwrap_or(defaults.min_retained_keys),
            snapshot_size: self.snapshot_size.unwrap_or(defaults.snapshot_size),
            primary_bucket: self.primary_bucket.clone(),
            backup_bucket: self.backup_bucket.clone(),
            log_retention_days: self.log_retention_days.unwrap_or(defaults.log_retention_days),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

fn print_report<T: Serialize>(report: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize report")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);
    tally_engine::metrics::register_metrics();

    let config = args.engine_config();
    let docs: Arc<dyn DocumentStore> = Arc::new(
        SqliteDocumentStore::open(&args.database)
            .with_context(|| format!("open database {}", args.database.display()))?,
    );
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(&args.blob_root));

    tracing::info!(
        database = %args.database.display(),
        blob_root = %args.blob_root.display(),
        primary = %config.primary_bucket,
        backup = %config.backup_bucket,
        "tally worker starting"
    );

    match args.command {
        Commands::Aggregate => {
            let engine = AggregationEngine::new(docs, config)?;
            print_report(&engine.run().await?)
        }
        Commands::Reconcile => {
            let engine = ReconciliationEngine::new(docs, blobs, config)?;
            print_report(&engine.run().await?)
        }
        Commands::Purge => {
            let purger = Purger::new(docs, blobs, config)?;
            print_report(&purger.run().await?)
        }
        Commands::Audit { address } => {
            let address = Address::new(address)?;
            let auditor = AddressAuditor::new(docs, blobs, config)?;
            let report = auditor.check(&address).await?;
            if !report.is_consistent() {
                tracing::warn!(
                    address = %address,
                    findings = report.findings.len(),
                    "address is inconsistent"
                );
            }
            print_report(&report)
        }
    }
}
