//! Time-based purge of deleted files and old log events.
//!
//! Deleted files are dropped from the backup bucket and their `FileInfo`
//! rows removed. Log events older than the retention window are removed.
//! `BucketInfo` and checkpoint rows are never purged.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tally_core::model::now_millis;
use tally_core::{BlobStore, DocumentKey, DocumentStore, Kind, run_span};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::SummaryStore;

/// Outcome of one purge run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    /// Run identifier.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Backup objects deleted.
    pub backup_objects_deleted: usize,
    /// `FileInfo` rows deleted.
    pub file_infos_deleted: usize,
    /// `FileLog` rows deleted.
    pub log_events_deleted: usize,
    /// Log events older than this were eligible.
    pub log_cutoff: DateTime<Utc>,
}

/// Removes deleted files and expired log events.
#[derive(Clone)]
pub struct Purger {
    store: SummaryStore,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
}

impl fmt::Debug for Purger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Purger")
            .field("store", &self.store)
            .field("blobs", &"BlobStore")
            .field("config", &self.config)
            .finish()
    }
}

impl Purger {
    /// Creates a purger.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not fit the store's limits.
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate(docs.limits())?;
        Ok(Self {
            store: SummaryStore::new(docs, &config),
            blobs,
            config,
        })
    }

    /// Runs one purge pass.
    ///
    /// # Errors
    ///
    /// Returns an error if a read, blob delete or commit fails. Work already
    /// committed stays done; the next run picks up the rest.
    pub async fn run(&self) -> Result<PurgeReport> {
        let run_id = Ulid::new();
        let started = Instant::now();

        let result = self
            .run_inner(run_id, started)
            .instrument(run_span("purge", run_id))
            .await;

        metrics::record_run("purge", started.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            tracing::error!(run_id = %run_id, error = %e, "purge run failed");
        }
        result
    }

    async fn run_inner(&self, run_id: Ulid, started: Instant) -> Result<PurgeReport> {
        let run_start = now_millis();
        let log_cutoff = run_start - Duration::days(i64::from(self.config.log_retention_days));

        let deleted = self.store.deleted_file_infos().await?;
        tracing::info!(deleted_file_infos = deleted.len(), "purging deleted files");

        // Objects before rows: a row left without its object is only an orphan.
        let mut backup_objects_deleted = 0;
        for info in &deleted {
            self.blobs.delete(&self.config.backup_bucket, &info.path).await?;
            backup_objects_deleted += 1;
        }
        let keys: Vec<DocumentKey> = deleted
            .iter()
            .map(|info| DocumentKey::new(Kind::FileInfo, info.path.as_str()))
            .collect();
        let file_infos_deleted = self.store.delete_all(keys).await?;
        metrics::record_rows_purged(Kind::FileInfo.as_str(), file_infos_deleted);

        let mut log_events_deleted = 0;
        loop {
            let expired = self
                .store
                .log_events_before(log_cutoff, self.config.fetch_limit)
                .await?;
            if expired.is_empty() {
                break;
            }
            let keys: Vec<DocumentKey> = expired
                .iter()
                .map(|event| DocumentKey::new(Kind::FileLog, event.key.as_str()))
                .collect();
            log_events_deleted += self.store.delete_all(keys).await?;
            if expired.len() < self.config.fetch_limit {
                break;
            }
        }
        metrics::record_rows_purged(Kind::FileLog.as_str(), log_events_deleted);

        let report = PurgeReport {
            run_id: run_id.to_string(),
            started_at: run_start,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            backup_objects_deleted,
            file_infos_deleted,
            log_events_deleted,
            log_cutoff,
        };
        tracing::info!(
            backup_objects_deleted = report.backup_objects_deleted,
            file_infos_deleted = report.file_infos_deleted,
            log_events_deleted = report.log_events_deleted,
            log_cutoff = %report.log_cutoff,
            "purge complete"
        );
        Ok(report)
    }
}
