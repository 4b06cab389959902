//! Engine configuration.

use serde::{Deserialize, Serialize};
use tally_core::StoreLimits;

use crate::error::{EngineError, Result};

const DEFAULT_FETCH_LIMIT: usize = 3200;
const DEFAULT_WRITE_BATCH_SIZE: usize = 64;
const DEFAULT_MIN_RETAINED_KEYS: usize = 10;
const DEFAULT_SNAPSHOT_SIZE: usize = 32;
const DEFAULT_LOG_RETENTION_DAYS: u32 = 30;

fn default_fetch_limit() -> usize {
    DEFAULT_FETCH_LIMIT
}

fn default_write_batch_size() -> usize {
    DEFAULT_WRITE_BATCH_SIZE
}

fn default_min_retained_keys() -> usize {
    DEFAULT_MIN_RETAINED_KEYS
}

fn default_snapshot_size() -> usize {
    DEFAULT_SNAPSHOT_SIZE
}

fn default_primary_bucket() -> String {
    "primary".to_string()
}

fn default_backup_bucket() -> String {
    "backup".to_string()
}

fn default_log_retention_days() -> u32 {
    DEFAULT_LOG_RETENTION_DAYS
}

/// Tunables shared by every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Maximum log events fetched per aggregation run, and the chunk size of
    /// every keyed read.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,

    /// Rows written per transaction.
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Minimum number of keys kept in a checkpoint.
    #[serde(default = "default_min_retained_keys")]
    pub min_retained_keys: usize,

    /// Number of newest log events reconciliation snapshots before scanning.
    #[serde(default = "default_snapshot_size")]
    pub snapshot_size: usize,

    /// Bucket holding live objects.
    #[serde(default = "default_primary_bucket")]
    pub primary_bucket: String,

    /// Bucket holding backup copies (including deleted objects).
    #[serde(default = "default_backup_bucket")]
    pub backup_bucket: String,

    /// Age after which log events are purged.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            write_batch_size: default_write_batch_size(),
            min_retained_keys: default_min_retained_keys(),
            snapshot_size: default_snapshot_size(),
            primary_bucket: default_primary_bucket(),
            backup_bucket: default_backup_bucket(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl EngineConfig {
    /// Checks the configuration against a store's limits.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for zero sizes, sizes above the store
    /// limits, or unusable bucket names.
    pub fn validate(&self, limits: StoreLimits) -> Result<()> {
        if self.fetch_limit == 0 || self.fetch_limit > limits.max_fetch {
            return Err(EngineError::config(format!(
                "fetchLimit must be between 1 and {}, got {}",
                limits.max_fetch, self.fetch_limit
            )));
        }
        if self.write_batch_size == 0 || self.write_batch_size > limits.max_mutations_per_commit {
            return Err(EngineError::config(format!(
                "writeBatchSize must be between 1 and {}, got {}",
                limits.max_mutations_per_commit, self.write_batch_size
            )));
        }
        if self.min_retained_keys == 0 {
            return Err(EngineError::config("minRetainedKeys must be at least 1"));
        }
        if self.snapshot_size == 0 || self.snapshot_size > limits.max_fetch {
            return Err(EngineError::config(format!(
                "snapshotSize must be between 1 and {}, got {}",
                limits.max_fetch, self.snapshot_size
            )));
        }
        if self.primary_bucket.is_empty() || self.backup_bucket.is_empty() {
            return Err(EngineError::config("bucket names cannot be empty"));
        }
        if self.primary_bucket == self.backup_bucket {
            return Err(EngineError::config(
                "primary and backup buckets must differ",
            ));
        }
        Ok(())
    }
}
