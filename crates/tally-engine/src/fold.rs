//! Folding log events into per-path and per-address accumulators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tally_core::{Action, Address, FileStatus, LogEvent};

/// Net effect of a run's events on one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccumulator {
    /// Status after the last applied event.
    pub status: FileStatus,
    /// Size from the last applied event that carried one.
    pub size: Option<u64>,
    /// Earliest applied event time.
    pub first_seen: DateTime<Utc>,
    /// Latest applied event time.
    pub last_seen: DateTime<Utc>,
}

/// Net effect of a run's events on one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketAccumulator {
    /// Last resolved issuer seen in the run.
    pub issuer: Option<String>,
    /// Sum of item deltas.
    pub item_delta: i64,
    /// Sum of size deltas.
    pub size_delta: i64,
    /// Earliest applied event time.
    pub first_seen: DateTime<Utc>,
    /// Latest applied event time.
    pub last_seen: DateTime<Utc>,
}

/// Accumulated state of one aggregation run.
#[derive(Debug, Default, Clone)]
pub struct Fold {
    files: BTreeMap<String, FileAccumulator>,
    buckets: BTreeMap<Address, BucketAccumulator>,
    applied: usize,
}

impl Fold {
    /// Creates an empty fold.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event.
    ///
    /// Nothing is recorded when the action or path is invalid.
    ///
    /// # Errors
    ///
    /// Returns a data error ([`tally_core::Error::UnknownAction`] or
    /// [`tally_core::Error::InvalidPath`]) for events that must be skipped.
    pub fn apply(&mut self, event: &LogEvent) -> tally_core::Result<Action> {
        let action = event.parsed_action()?;
        let address = event.address()?;
        let at = event.create_date;

        let file = self
            .files
            .entry(event.path.clone())
            .or_insert_with(|| FileAccumulator {
                status: action.resulting_status(),
                size: None,
                first_seen: at,
                last_seen: at,
            });
        file.status = action.resulting_status();
        if let (Action::Create | Action::Update, Some(size)) = (action, event.size) {
            file.size = Some(size);
        }
        file.first_seen = file.first_seen.min(at);
        file.last_seen = file.last_seen.max(at);

        let bucket = self
            .buckets
            .entry(address)
            .or_insert_with(|| BucketAccumulator {
                issuer: None,
                item_delta: 0,
                size_delta: 0,
                first_seen: at,
                last_seen: at,
            });
        if let Some(issuer) = event.resolved_issuer() {
            bucket.issuer = Some(issuer.to_string());
        }
        bucket.item_delta = bucket.item_delta.saturating_add(action.item_delta());
        bucket.size_delta = bucket.size_delta.saturating_add(event.size_change);
        bucket.first_seen = bucket.first_seen.min(at);
        bucket.last_seen = bucket.last_seen.max(at);

        self.applied += 1;
        Ok(action)
    }

    /// Per-path accumulators, by path.
    #[must_use]
    pub fn files(&self) -> &BTreeMap<String, FileAccumulator> {
        &self.files
    }

    /// Per-address accumulators, by address.
    #[must_use]
    pub fn buckets(&self) -> &BTreeMap<Address, BucketAccumulator> {
        &self.buckets
    }

    /// Number of events applied.
    #[must_use]
    pub const fn applied(&self) -> usize {
        self.applied
    }

    /// Returns true if no event was applied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }
}
