//! Watermark checkpoints.
//!
//! A checkpoint records a watermark `W` and a set of processed keys. Every log
//! event older than `W` has been applied; events at `W` itself may or may not
//! have been, so the keys of every event sharing the newest timestamp are kept
//! and the next run skips them. The key set is padded to a minimum size so
//! events a little older than `W` are also covered.
//!
//! Checkpoints are append-only. The row with the greatest watermark (newest
//! write on ties) is authoritative.

use chrono::{DateTime, Utc};
use tally_core::{Checkpoint, LogEvent};
use ulid::Ulid;

use crate::error::Result;
use crate::store::SummaryStore;

/// Loads and persists checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: SummaryStore,
    min_retained_keys: usize,
}

impl CheckpointManager {
    /// Creates a manager keeping at least `min_retained_keys` keys per checkpoint.
    #[must_use]
    pub fn new(store: SummaryStore, min_retained_keys: usize) -> Self {
        Self {
            store,
            min_retained_keys,
        }
    }

    /// Loads the authoritative checkpoint, or [`Checkpoint::zero`] if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store query fails.
    pub async fn load(&self) -> Result<Checkpoint> {
        let checkpoint = self.store.latest_checkpoint().await?;
        match checkpoint {
            Some(checkpoint) => {
                tracing::debug!(
                    id = %checkpoint.id,
                    watermark = %checkpoint.watermark,
                    keys = checkpoint.processed_keys.len(),
                    "loaded checkpoint"
                );
                Ok(checkpoint)
            }
            None => {
                tracing::info!("no checkpoint found, starting from epoch");
                Ok(Checkpoint::zero())
            }
        }
    }

    /// Computes the checkpoint following a run over `events`.
    ///
    /// `events` must be ascending by `create_date`.
    #[must_use]
    pub fn compute_next(&self, events: &[LogEvent], run_start: DateTime<Utc>) -> Checkpoint {
        next_checkpoint(events, run_start, self.min_retained_keys)
    }

    /// Appends a checkpoint row. Prior rows are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.insert_checkpoint(checkpoint).await?;
        tracing::debug!(
            id = %checkpoint.id,
            watermark = %checkpoint.watermark,
            keys = checkpoint.processed_keys.len(),
            "saved checkpoint"
        );
        Ok(())
    }
}

/// Computes the next checkpoint from ascending `events`.
///
/// Keys are collected newest first. Collection stops once at least
/// `min_retained_keys` were taken and the next candidate has a different
/// timestamp than the last one taken, so a timestamp group is never split.
#[must_use]
pub fn next_checkpoint(
    events: &[LogEvent],
    run_start: DateTime<Utc>,
    min_retained_keys: usize,
) -> Checkpoint {
    let mut processed_keys = Vec::new();
    let mut last_taken: Option<DateTime<Utc>> = None;

    for event in events.iter().rev() {
        if processed_keys.len() >= min_retained_keys
            && last_taken.is_some_and(|taken| taken != event.create_date)
        {
            break;
        }
        processed_keys.push(event.key.clone());
        last_taken = Some(event.create_date);
    }

    let watermark = events
        .iter()
        .map(|event| event.create_date)
        .max()
        .unwrap_or(run_start);

    let written_at = tally_core::model::now_millis();
    Checkpoint {
        id: Ulid::new().to_string(),
        processed_keys,
        watermark,
        written_at,
    }
}
