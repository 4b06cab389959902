//! Full reconciliation of summaries against blob storage.
//!
//! Reconciliation is the authority of last resort. It ignores the log for
//! the purpose of counting and rebuilds `FileInfo` and `BucketInfo` from what
//! the primary and backup buckets actually hold:
//!
//! - every primary object is live, and must have a backup copy at least as new
//! - every backup-only object is a deleted file
//! - an address's rollup is the count and total size of its primary objects
//!
//! Rows with no backing object are reported, never deleted. Log events that
//! landed while the scan ran are reported too: they may be applied on top of
//! an already-reconciled rollup by the next aggregation run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::model::{ISSUER_PLACEHOLDER, now_millis};
use tally_core::{
    Address, BlobMeta, BlobStore, BucketInfo, DocumentStore, FileInfo, FileStatus, Kind,
    LogEvent, extract_address, run_span,
};
use tracing::Instrument;
use ulid::Ulid;

use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::store::SummaryStore;

// ============================================================================
// Reconciliation Report
// ============================================================================

/// Report from a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Run identifier.
    pub run_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Log events captured before the scan.
    pub snapshot_events: usize,
    /// Newest timestamp in the snapshot (run start if the log was empty).
    pub snapshot_watermark: DateTime<Utc>,
    /// Objects listed in the primary bucket.
    pub primary_objects: usize,
    /// Objects listed in the backup bucket.
    pub backup_objects: usize,
    /// Paths copied from primary to backup.
    pub backup_copies: Vec<String>,
    /// File summaries written.
    pub file_infos_written: usize,
    /// Address rollups written.
    pub bucket_infos_written: usize,
    /// Watermark of the checkpoint written by the run.
    pub watermark: DateTime<Utc>,
    /// Consistency findings.
    pub issues: Vec<ReconciliationIssue>,
}

impl ReconciliationReport {
    /// Returns true if any issues were found.
    #[must_use]
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Returns issues of a specific type.
    #[must_use]
    pub fn issues_of_type(&self, issue_type: IssueType) -> Vec<&ReconciliationIssue> {
        self.issues
            .iter()
            .filter(|i| i.issue_type == issue_type)
            .collect()
    }
}

/// A specific reconciliation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationIssue {
    /// Type of issue.
    pub issue_type: IssueType,
    /// Affected path, address or log key.
    pub subject: String,
    /// Human-readable description.
    pub description: String,
    /// Severity level.
    pub severity: Severity,
}

/// Type of reconciliation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    /// `FileInfo` whose path is in neither bucket.
    OrphanedFileInfo,
    /// `BucketInfo` whose address has no primary object.
    OrphanedBucketInfo,
    /// Log event written while the scan was running.
    RacedEvent,
    /// Object whose path does not name an address.
    InvalidObjectPath,
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OrphanedFileInfo => "orphaned_file_info",
            Self::OrphanedBucketInfo => "orphaned_bucket_info",
            Self::RacedEvent => "raced_event",
            Self::InvalidObjectPath => "invalid_object_path",
        })
    }
}

/// Severity of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - no action required.
    Info,
    /// Warning - should be investigated.
    Warning,
    /// Error - requires attention.
    Error,
}

// ============================================================================
// Rebuild helpers
// ============================================================================

/// Rollup rebuilt from primary objects.
#[derive(Debug, Clone, Copy)]
struct Rollup {
    items: i64,
    size: i64,
    first_created: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl Rollup {
    fn new(object: &BlobMeta) -> Self {
        Self {
            items: 0,
            size: 0,
            first_created: object.created_at,
            last_updated: object.updated_at,
        }
    }

    fn add(&mut self, object: &BlobMeta) {
        self.items += 1;
        self.size = self
            .size
            .saturating_add(i64::try_from(object.size).unwrap_or(i64::MAX));
        self.first_created = self.first_created.min(object.created_at);
        self.last_updated = self.last_updated.max(object.updated_at);
    }
}

/// Rebuilds a file summary from an object, returning it only if the stored
/// row is missing or disagrees on status, size or update time.
fn rebuild_file(
    object: &BlobMeta,
    status: FileStatus,
    stored: Option<&FileInfo>,
) -> Option<FileInfo> {
    let rebuilt = FileInfo {
        path: object.path.clone(),
        status,
        size: object.size,
        create_date: stored.map_or(object.created_at, |info| info.create_date),
        update_date: object.updated_at,
    };
    match stored {
        Some(existing) if !rebuilt.differs_from(existing) => None,
        _ => Some(rebuilt),
    }
}

/// Rebuilds an address rollup, returning it only if the stored row is
/// missing or disagrees on count, size or update time.
fn rebuild_bucket(address: &Address, rollup: &Rollup, stored: Option<&BucketInfo>) -> Option<BucketInfo> {
    match stored {
        Some(existing)
            if existing.item_count == rollup.items
                && existing.total_size == rollup.size
                && existing.update_date == rollup.last_updated =>
        {
            None
        }
        Some(existing) => Some(BucketInfo {
            item_count: rollup.items,
            total_size: rollup.size,
            update_date: rollup.last_updated,
            ..existing.clone()
        }),
        None => Some(BucketInfo {
            address: address.clone(),
            issuer_address: ISSUER_PLACEHOLDER.to_string(),
            item_count: rollup.items,
            total_size: rollup.size,
            create_date: rollup.first_created,
            update_date: rollup.last_updated,
        }),
    }
}

// ============================================================================
// Reconciliation Engine
// ============================================================================

/// Rebuilds summaries from the primary and backup buckets.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: SummaryStore,
    blobs: Arc<dyn BlobStore>,
    checkpoints: CheckpointManager,
    config: EngineConfig,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("store", &self.store)
            .field("blobs", &"BlobStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Creates an engine over a document store and a blob store.
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
        let store = SummaryStore::new(docs, &config);
        let checkpoints = CheckpointManager::new(store.clone(), config.min_retained_keys);
        Ok(Self {
            store,
            blobs,
            checkpoints,
            config,
        })
    }

    /// Performs a full rebuild.
    ///
    /// # Errors
    ///
    /// Returns an error if a listing, copy, read or commit fails. No
    /// checkpoint is written in that case.
    pub async fn run(&self) -> Result<ReconciliationReport> {
        let run_id = Ulid::new();
        let started = Instant::now();

        let result = self
            .run_inner(run_id, started)
            .instrument(run_span("reconcile", run_id))
            .await;

        metrics::record_run("reconcile", started.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            tracing::error!(run_id = %run_id, error = %e, "reconciliation run failed");
        }
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_inner(&self, run_id: Ulid, started: Instant) -> Result<ReconciliationReport> {
        let run_start = now_millis();
        tracing::info!(
            primary = %self.config.primary_bucket,
            backup = %self.config.backup_bucket,
            "reconciliation started"
        );

        // Snapshot before listing so anything newer can be flagged afterwards.
        let snapshot = self.store.latest_log_events(self.config.snapshot_size).await?;
        let snapshot_watermark = snapshot
            .iter()
            .map(|event| event.create_date)
            .max()
            .unwrap_or(run_start);

        let file_infos: HashMap<String, FileInfo> = self
            .store
            .all_file_infos()
            .await?
            .into_iter()
            .map(|info| (info.path.clone(), info))
            .collect();
        let bucket_infos: HashMap<Address, BucketInfo> = self
            .store
            .all_bucket_infos()
            .await?
            .into_iter()
            .map(|info| (info.address.clone(), info))
            .collect();

        let primary = self.blobs.list(&self.config.primary_bucket, "").await?;
        let backup = self.blobs.list(&self.config.backup_bucket, "").await?;
        tracing::info!(
            snapshot_events = snapshot.len(),
            file_infos = file_infos.len(),
            bucket_infos = bucket_infos.len(),
            primary_objects = primary.len(),
            backup_objects = backup.len(),
            "loaded state"
        );

        let backup_by_path: HashMap<&str, &BlobMeta> =
            backup.iter().map(|o| (o.path.as_str(), o)).collect();
        let primary_paths: HashSet<&str> = primary.iter().map(|o| o.path.as_str()).collect();

        let mut issues = Vec::new();
        let mut backup_copies = Vec::new();
        let mut file_updates = Vec::new();
        let mut rollups: BTreeMap<Address, Rollup> = BTreeMap::new();

        for object in &primary {
            let address = match extract_address(&object.path) {
                Ok(address) => address,
                Err(e) => {
                    issues.push(invalid_object(&self.config.primary_bucket, object, &e));
                    continue;
                }
            };

            let needs_copy = backup_by_path
                .get(object.path.as_str())
                .is_none_or(|copy| copy.updated_at < object.updated_at);
            if needs_copy {
                self.blobs
                    .copy(&self.config.primary_bucket, &object.path, &self.config.backup_bucket)
                    .await
                    .map_err(|source| EngineError::BackupCopy {
                        path: object.path.clone(),
                        source,
                    })?;
                tracing::info!(path = %object.path, "copied object to backup");
                backup_copies.push(object.path.clone());
            }

            if let Some(info) = rebuild_file(object, FileStatus::Active, file_infos.get(&object.path)) {
                file_updates.push(info);
            }
            rollups
                .entry(address)
                .or_insert_with(|| Rollup::new(object))
                .add(object);
        }

        for object in backup.iter().filter(|o| !primary_paths.contains(o.path.as_str())) {
            if let Err(e) = extract_address(&object.path) {
                issues.push(invalid_object(&self.config.backup_bucket, object, &e));
                continue;
            }
            if let Some(info) = rebuild_file(object, FileStatus::Deleted, file_infos.get(&object.path)) {
                file_updates.push(info);
            }
        }

        let bucket_updates: Vec<BucketInfo> = rollups
            .iter()
            .filter_map(|(address, rollup)| rebuild_bucket(address, rollup, bucket_infos.get(address)))
            .collect();

        let file_infos_written = self.store.save_all(file_updates).await?;
        metrics::record_rows_written(Kind::FileInfo.as_str(), file_infos_written);
        let bucket_infos_written = self.store.save_all(bucket_updates).await?;
        metrics::record_rows_written(Kind::BucketInfo.as_str(), bucket_infos_written);

        // Orphans: reported, never deleted.
        let mut orphan_paths: Vec<&String> = file_infos
            .keys()
            .filter(|path| {
                !primary_paths.contains(path.as_str()) && !backup_by_path.contains_key(path.as_str())
            })
            .collect();
        orphan_paths.sort();
        for path in &orphan_paths {
            tracing::warn!(path = %path, "FileInfo has no object in either bucket");
            issues.push(ReconciliationIssue {
                issue_type: IssueType::OrphanedFileInfo,
                subject: (*path).clone(),
                description: "FileInfo has no object in the primary or backup bucket".to_string(),
                severity: Severity::Warning,
            });
        }
        let orphan_files = orphan_paths.len();

        let mut orphan_addresses: Vec<&Address> = bucket_infos
            .keys()
            .filter(|address| !rollups.contains_key(*address))
            .collect();
        orphan_addresses.sort();
        for address in &orphan_addresses {
            tracing::warn!(address = %address, "BucketInfo has no primary objects");
            issues.push(ReconciliationIssue {
                issue_type: IssueType::OrphanedBucketInfo,
                subject: address.to_string(),
                description: "BucketInfo address has no object in the primary bucket".to_string(),
                severity: Severity::Warning,
            });
        }
        let orphan_buckets = orphan_addresses.len();

        let raced = self.raced_events(&snapshot, snapshot_watermark).await?;
        for event in &raced {
            tracing::warn!(key = %event.key, path = %event.path, action = %event.action, create_date = %event.create_date, "log event raced the scan");
            issues.push(ReconciliationIssue {
                issue_type: IssueType::RacedEvent,
                subject: event.key.clone(),
                description: format!(
                    "{} on '{}' at {} was written during the scan",
                    event.action, event.path, event.create_date
                ),
                severity: Severity::Warning,
            });
        }

        let next = self.checkpoints.compute_next(&snapshot, run_start);
        self.checkpoints.save(&next).await?;

        metrics::record_reconciliation(orphan_files, orphan_buckets, raced.len(), backup_copies.len());

        let report = ReconciliationReport {
            run_id: run_id.to_string(),
            started_at: run_start,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            snapshot_events: snapshot.len(),
            snapshot_watermark,
            primary_objects: primary.len(),
            backup_objects: backup.len(),
            backup_copies,
            file_infos_written,
            bucket_infos_written,
            watermark: next.watermark,
            issues,
        };

        tracing::info!(
            primary_objects = report.primary_objects,
            backup_objects = report.backup_objects,
            backup_copies = report.backup_copies.len(),
            file_infos_written = report.file_infos_written,
            bucket_infos_written = report.bucket_infos_written,
            orphan_files,
            orphan_buckets,
            raced_events = raced.len(),
            watermark = %report.watermark,
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Returns log events at or after the snapshot watermark that the snapshot missed.
    async fn raced_events(
        &self,
        snapshot: &[LogEvent],
        since: DateTime<Utc>,
    ) -> Result<Vec<LogEvent>> {
        let known: HashSet<&str> = snapshot.iter().map(|e| e.key.as_str()).collect();
        let newer = self
            .store
            .log_events_since(since, self.config.fetch_limit)
            .await?;
        Ok(newer
            .into_iter()
            .filter(|event| !known.contains(event.key.as_str()))
            .collect())
    }
}

fn invalid_object(bucket: &str, object: &BlobMeta, error: &tally_core::Error) -> ReconciliationIssue {
    tracing::warn!(bucket = %bucket, path = %object.path, error = %error, "skipping object with invalid path");
    ReconciliationIssue {
        issue_type: IssueType::InvalidObjectPath,
        subject: format!("{bucket}/{}", object.path),
        description: error.to_string(),
        severity: Severity::Error,
    }
}
