//! Incremental aggregation of the file log into summaries.
//!
//! # Run outline
//!
//! ```text
//! load checkpoint (watermark W, processed keys K)
//!     │
//!     ├── fetch events with createDate >= W, oldest first, skipping K,
//!     │   until fetch_limit fresh events or the log is exhausted
//!     │
//!     ├── fold fresh events into per-path / per-address accumulators
//!     │
//!     ├── load stored rows for touched keys, merge, keep changed rows
//!     │
//!     ├── write changed rows in batches (one transaction per batch)
//!     │
//!     └── append the next checkpoint
//! ```
//!
//! The checkpoint is written last; it is the run's commit marker. A run that
//! fails before that point is repeated in full by the next invocation, and
//! change detection keeps the repeated file writes from doing anything.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::model::now_millis;
use tally_core::{Address, Checkpoint, DocumentStore, Kind, LogEvent, run_span};
use tracing::Instrument;
use ulid::Ulid;

use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::fold::Fold;
use crate::merge::{merge_bucket, merge_file};
use crate::metrics;
use crate::store::SummaryStore;

/// Outcome of one aggregation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    /// Run identifier (also on every log line of the run).
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Events read from the log, including skipped ones.
    pub events_fetched: usize,
    /// Events skipped because the checkpoint lists them as processed.
    pub events_skipped: usize,
    /// Events folded into summaries.
    pub events_applied: usize,
    /// Events rejected as invalid.
    pub events_rejected: usize,
    /// File summaries written.
    pub file_infos_written: usize,
    /// Address rollups written.
    pub bucket_infos_written: usize,
    /// Watermark the run started from.
    pub previous_watermark: DateTime<Utc>,
    /// Watermark of the checkpoint written by the run.
    pub watermark: DateTime<Utc>,
    /// True if more events may be waiting beyond this run's fetch.
    pub fetch_capped: bool,
}

/// Folds new log events into `FileInfo` and `BucketInfo`.
#[derive(Debug, Clone)]
pub struct AggregationEngine {
    store: SummaryStore,
    checkpoints: CheckpointManager,
    config: EngineConfig,
}

/// Events pulled from the log for one run.
struct Fetched {
    /// Every event read, ascending, duplicates removed.
    events: Vec<LogEvent>,
    /// Whether the last page came back full or had unread rows.
    capped: bool,
}

impl AggregationEngine {
    /// Creates an engine over a document store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not fit the store's limits.
    pub fn new(docs: Arc<dyn DocumentStore>, config: EngineConfig) -> Result<Self> {
        config.validate(docs.limits())?;
        let store = SummaryStore::new(docs, &config);
        let checkpoints = CheckpointManager::new(store.clone(), config.min_retained_keys);
        Ok(Self {
            store,
            checkpoints,
            config,
        })
    }

    /// Performs one bounded incremental step.
    ///
    /// # Errors
    ///
    /// Returns an error if a read or a commit fails. No checkpoint is written
    /// in that case.
    pub async fn run(&self) -> Result<AggregationReport> {
        let run_id = Ulid::new();
        let started = Instant::now();

        let result = self
            .run_inner(run_id, started)
            .instrument(run_span("aggregate", run_id))
            .await;

        metrics::record_run("aggregate", started.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            tracing::error!(run_id = %run_id, error = %e, "aggregation run failed");
        }
        result
    }

    async fn run_inner(&self, run_id: Ulid, started: Instant) -> Result<AggregationReport> {
        let run_start = now_millis();
        let checkpoint = self.checkpoints.load().await?;
        tracing::info!(
            watermark = %checkpoint.watermark,
            processed_keys = checkpoint.processed_keys.len(),
            "aggregation started"
        );

        let fetched = self.fetch_events(&checkpoint).await?;
        let processed = checkpoint.processed_key_set();

        let mut fold = Fold::new();
        let mut skipped = 0;
        let mut rejected = 0;
        for event in &fetched.events {
            if processed.contains(event.key.as_str()) {
                skipped += 1;
                continue;
            }
            match fold.apply(event) {
                Ok(_) => {}
                Err(e) if e.is_data_error() => {
                    tracing::warn!(key = %event.key, path = %event.path, action = %event.action, error = %e, "skipping invalid log event");
                    rejected += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        metrics::record_events(fold.applied(), rejected);

        let (file_infos_written, bucket_infos_written) = self.write_summaries(&fold).await?;

        let next = self.checkpoints.compute_next(&fetched.events, run_start);
        self.checkpoints.save(&next).await?;

        let report = AggregationReport {
            run_id: run_id.to_string(),
            started_at: run_start,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            events_fetched: fetched.events.len(),
            events_skipped: skipped,
            events_applied: fold.applied(),
            events_rejected: rejected,
            file_infos_written,
            bucket_infos_written,
            previous_watermark: checkpoint.watermark,
            watermark: next.watermark,
            fetch_capped: fetched.capped,
        };

        tracing::info!(
            events_fetched = report.events_fetched,
            events_skipped = report.events_skipped,
            events_applied = report.events_applied,
            events_rejected = report.events_rejected,
            file_infos_written = report.file_infos_written,
            bucket_infos_written = report.bucket_infos_written,
            watermark = %report.watermark,
            fetch_capped = report.fetch_capped,
            "aggregation complete"
        );
        Ok(report)
    }

    /// Reads events at or after the watermark.
    ///
    /// Pages past already-processed keys so a page made entirely of them
    /// cannot stall progress, and stops after `fetch_limit` fresh events.
    async fn fetch_events(&self, checkpoint: &Checkpoint) -> Result<Fetched> {
        let limit = self.config.fetch_limit;
        let processed = checkpoint.processed_key_set();

        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let mut fresh = 0;
        let mut offset = 0;
        let capped = loop {
            let page = self
                .store
                .log_events_since_page(checkpoint.watermark, limit, offset)
                .await?;
            let full = page.len() == limit;
            let mut rows = page.into_iter();

            for event in rows.by_ref() {
                if !seen.insert(event.key.clone()) {
                    continue;
                }
                if !processed.contains(event.key.as_str()) {
                    fresh += 1;
                }
                events.push(event);
                if fresh == limit {
                    break;
                }
            }

            // Rows left behind on a short page are still pending.
            let left_over = !rows.as_slice().is_empty();
            if fresh == limit || !full {
                break full || left_over;
            }
            offset += limit;
        };

        tracing::debug!(fetched = events.len(), fresh, capped, "fetched log events");
        Ok(Fetched { events, capped })
    }

    async fn write_summaries(&self, fold: &Fold) -> Result<(usize, usize)> {
        if fold.is_empty() {
            return Ok((0, 0));
        }

        let paths: Vec<String> = fold.files().keys().cloned().collect();
        let addresses: Vec<Address> = fold.buckets().keys().cloned().collect();
        let stored_files = self.store.file_infos_by_paths(&paths).await?;
        let stored_buckets = self.store.bucket_infos_by_addresses(&addresses).await?;
        tracing::debug!(
            touched_paths = paths.len(),
            stored_paths = stored_files.len(),
            touched_addresses = addresses.len(),
            stored_addresses = stored_buckets.len(),
            "loaded stored summaries"
        );

        let file_updates: Vec<_> = fold
            .files()
            .iter()
            .filter_map(|(path, acc)| merge_file(path, acc, stored_files.get(path)))
            .collect();
        let bucket_updates: Vec<_> = fold
            .buckets()
            .iter()
            .filter_map(|(address, acc)| merge_bucket(address, acc, stored_buckets.get(address)))
            .collect();

        let files_written = self.store.save_all(file_updates).await?;
        metrics::record_rows_written(Kind::FileInfo.as_str(), files_written);
        let buckets_written = self.store.save_all(bucket_updates).await?;
        metrics::record_rows_written(Kind::BucketInfo.as_str(), buckets_written);

        Ok((files_written, buckets_written))
    }
}
