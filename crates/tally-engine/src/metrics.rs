//! Job metrics.
//!
//! Recorded through the `metrics` facade. Nothing is exported unless the
//! host process installs a recorder.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Metric Names
// ============================================================================

/// Log events folded into summaries.
pub const EVENTS_APPLIED: &str = "tally_events_applied_total";

/// Log events skipped as invalid (unknown action, bad path).
pub const EVENTS_REJECTED: &str = "tally_events_rejected_total";

/// Summary rows written, labelled by kind.
pub const ROWS_WRITTEN: &str = "tally_rows_written_total";

/// Rows deleted by the purge job, labelled by kind.
pub const ROWS_PURGED: &str = "tally_rows_purged_total";

/// Job duration histogram, labelled by job.
pub const RUN_DURATION: &str = "tally_run_duration_seconds";

/// Failed runs, labelled by job.
pub const RUN_FAILURES: &str = "tally_run_failures_total";

/// Orphaned summary rows found by reconciliation, labelled by kind.
pub const ORPHANS: &str = "tally_orphans_total";

/// Log events that raced a reconciliation scan.
pub const RACED_EVENTS: &str = "tally_raced_events_total";

/// Objects copied from primary to backup.
pub const BACKUP_COPIES: &str = "tally_backup_copies_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all metric descriptions.
///
/// Call this once at application startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(EVENTS_APPLIED, "Log events folded into summaries");
    describe_counter!(EVENTS_REJECTED, "Log events skipped as invalid");
    describe_counter!(ROWS_WRITTEN, "Summary rows written");
    describe_counter!(ROWS_PURGED, "Rows deleted by the purge job");
    describe_histogram!(RUN_DURATION, "Duration of job runs in seconds");
    describe_counter!(RUN_FAILURES, "Job runs that ended in an error");
    describe_counter!(ORPHANS, "Summary rows with no backing object");
    describe_counter!(RACED_EVENTS, "Log events written during a reconciliation scan");
    describe_counter!(BACKUP_COPIES, "Objects copied from primary to backup");
}

// ============================================================================
// Recording
// ============================================================================

/// Records the outcome of folding a batch of events.
pub fn record_events(applied: usize, rejected: usize) {
    counter!(EVENTS_APPLIED).increment(applied as u64);
    counter!(EVENTS_REJECTED).increment(rejected as u64);
}

/// Records rows written for one kind.
pub fn record_rows_written(kind: &'static str, rows: usize) {
    counter!(ROWS_WRITTEN, "kind" => kind).increment(rows as u64);
}

/// Records rows purged for one kind.
pub fn record_rows_purged(kind: &'static str, rows: usize) {
    counter!(ROWS_PURGED, "kind" => kind).increment(rows as u64);
}

/// Records a finished run.
pub fn record_run(job: &'static str, duration_secs: f64, succeeded: bool) {
    histogram!(RUN_DURATION, "job" => job).record(duration_secs);
    if !succeeded {
        counter!(RUN_FAILURES, "job" => job).increment(1);
    }
}

/// Records reconciliation findings.
pub fn record_reconciliation(orphan_files: usize, orphan_buckets: usize, raced: usize, copies: usize) {
    counter!(ORPHANS, "kind" => "FileInfo").increment(orphan_files as u64);
    counter!(ORPHANS, "kind" => "BucketInfo").increment(orphan_buckets as u64);
    counter!(RACED_EVENTS).increment(raced as u64);
    counter!(BACKUP_COPIES).increment(copies as u64);
}
