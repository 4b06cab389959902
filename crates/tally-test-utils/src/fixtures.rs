//! Test data builders and a pre-wired test context.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::{
    Action, Address, BlobStore, BucketInfo, DocumentStore, FileInfo, FileStatus, LogEvent,
    MemoryBlobStore, MemoryDocumentStore,
};

/// Default primary bucket name used by [`TestContext`].
pub const PRIMARY: &str = "primary";
/// Default backup bucket name used by [`TestContext`].
pub const BACKUP: &str = "backup";

/// Timestamp from epoch milliseconds.
pub fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).expect("millis in range")
}

/// Builds a log event with an explicit action.
pub fn event(
    key: &str,
    path: &str,
    action: Action,
    size: Option<u64>,
    size_change: i64,
    millis: i64,
) -> LogEvent {
    LogEvent {
        key: key.to_string(),
        path: path.to_string(),
        issuer_address: None,
        action: action.as_str().to_string(),
        size,
        size_change,
        create_date: at(millis),
    }
}

/// A `Create` event of a file with `size` bytes.
pub fn create(key: &str, path: &str, size: u64, millis: i64) -> LogEvent {
    event(
        key,
        path,
        Action::Create,
        Some(size),
        i64::try_from(size).expect("size fits i64"),
        millis,
    )
}

/// An `Update` event to `size` bytes with the given delta.
pub fn update(key: &str, path: &str, size: u64, size_change: i64, millis: i64) -> LogEvent {
    event(key, path, Action::Update, Some(size), size_change, millis)
}

/// A `Delete` event removing `size_change` bytes (negative).
pub fn delete(key: &str, path: &str, size_change: i64, millis: i64) -> LogEvent {
    event(key, path, Action::Delete, None, size_change, millis)
}

/// Sets the issuer on an event.
pub fn with_issuer(mut event: LogEvent, issuer: &str) -> LogEvent {
    event.issuer_address = Some(issuer.to_string());
    event
}

/// A `FileInfo` with equal create and update dates.
pub fn file_info(path: &str, status: FileStatus, size: u64, millis: i64) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        status,
        size,
        create_date: at(millis),
        update_date: at(millis),
    }
}

/// A `BucketInfo` with equal create and update dates.
pub fn bucket_info(address: &str, issuer: &str, items: i64, size: i64, millis: i64) -> BucketInfo {
    BucketInfo {
        address: Address::new(address).expect("valid address"),
        issuer_address: issuer.to_string(),
        item_count: items,
        total_size: size,
        create_date: at(millis),
        update_date: at(millis),
    }
}

/// Memory-backed stores shared by a test.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Concrete document store, for seeding and counting.
    pub docs: Arc<MemoryDocumentStore>,
    /// Concrete blob store, for seeding and inspection.
    pub blobs: Arc<MemoryBlobStore>,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    /// Creates a context with empty stores.
    pub fn new() -> Self {
        Self {
            docs: Arc::new(MemoryDocumentStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    /// The document store as a trait object.
    pub fn doc_store(&self) -> Arc<dyn DocumentStore> {
        self.docs.clone()
    }

    /// The blob store as a trait object.
    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// Appends log events.
    pub fn log(&self, events: impl IntoIterator<Item = LogEvent>) {
        self.docs.seed(events).expect("seed events");
    }

    /// Writes `size` bytes to `path` in the primary bucket.
    pub fn put_primary(&self, path: &str, size: usize, millis: i64) {
        self.blobs
            .put_at(PRIMARY, path, vec![0_u8; size], at(millis), at(millis))
            .expect("put primary");
    }

    /// Writes `size` bytes to `path` in the backup bucket.
    pub fn put_backup(&self, path: &str, size: usize, millis: i64) {
        self.blobs
            .put_at(BACKUP, path, vec![0_u8; size], at(millis), at(millis))
            .expect("put backup");
    }
}
