//! Records stored in the document store.
//!
//! | kind          | key       | owner                          |
//! |---------------|-----------|--------------------------------|
//! | `FileLog`     | `key`     | storage hub (read-only here)   |
//! | `FileInfo`    | `path`    | aggregation + reconciliation   |
//! | `BucketInfo`  | `address` | aggregation + reconciliation   |
//! | `FileWorkLog` | `id`      | checkpoint manager (append-only) |
//!
//! Field names are camelCase and timestamps are epoch milliseconds, matching
//! what the storage hub writes.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::path::{Address, extract_address};

/// Issuer placeholder written by producers that do not know the issuer.
pub const ISSUER_PLACEHOLDER: &str = "n/a";

/// Truncates a timestamp to the millisecond precision used in storage.
///
/// Timestamps compared against stored values must go through this first,
/// otherwise sub-millisecond noise reads as a change on every run.
#[must_use]
pub fn truncate_to_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

/// Current time at storage precision.
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

/// The kind of change a log event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// A new file was written.
    Create,
    /// An existing file was overwritten.
    Update,
    /// A file was removed.
    Delete,
}

impl Action {
    /// Returns the canonical action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
        }
    }

    /// Change in item count contributed by this action.
    #[must_use]
    pub const fn item_delta(self) -> i64 {
        match self {
            Self::Create => 1,
            Self::Update => 0,
            Self::Delete => -1,
        }
    }

    /// Status a file has after this action.
    #[must_use]
    pub const fn resulting_status(self) -> FileStatus {
        match self {
            Self::Create | Self::Update => FileStatus::Active,
            Self::Delete => FileStatus::Deleted,
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Create" | "createFile" | "moveFilePutStep" => Ok(Self::Create),
            "Update" | "updateFile" | "putFile" => Ok(Self::Update),
            "Delete" | "deleteFile" | "moveFileDelStep" => Ok(Self::Delete),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// The file exists in the primary store.
    Active,
    /// The file was removed from the primary store.
    Deleted,
}

impl FileStatus {
    /// Returns the status name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the storage hub's append-only file log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Unique key, roughly increasing with creation.
    pub key: String,
    /// File path (`address/...`).
    pub path: String,
    /// Issuer address associated with the write, if known.
    #[serde(rename = "assoIssAddress", default)]
    pub issuer_address: Option<String>,
    /// Raw action value as written by the producer.
    pub action: String,
    /// Absolute size after the action (Create/Update only).
    #[serde(default)]
    pub size: Option<u64>,
    /// Signed size delta caused by the action.
    #[serde(default)]
    pub size_change: i64,
    /// Event timestamp. Not unique.
    #[serde(with = "ts_milliseconds")]
    pub create_date: DateTime<Utc>,
}

impl LogEvent {
    /// Parses the raw action value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAction`] for values outside the known set.
    pub fn parsed_action(&self) -> Result<Action> {
        self.action.parse()
    }

    /// Returns the owning address of the event's path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] if the path is malformed.
    pub fn address(&self) -> Result<Address> {
        extract_address(&self.path)
    }

    /// Returns the issuer if it is a real value (non-empty, not the placeholder).
    #[must_use]
    pub fn resolved_issuer(&self) -> Option<&str> {
        self.issuer_address
            .as_deref()
            .filter(|issuer| !issuer.is_empty() && *issuer != ISSUER_PLACEHOLDER)
    }
}

/// Derived per-file state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// File path; the row key.
    pub path: String,
    /// Whether the file currently exists.
    pub status: FileStatus,
    /// Size in bytes as of the last applied change.
    pub size: u64,
    /// When the path was first observed.
    #[serde(with = "ts_milliseconds")]
    pub create_date: DateTime<Utc>,
    /// Timestamp of the last applied change.
    #[serde(with = "ts_milliseconds")]
    pub update_date: DateTime<Utc>,
}

impl FileInfo {
    /// Returns true if any tracked field differs from `other`.
    ///
    /// `create_date` is not tracked: it is fixed when the row is first written.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.status != other.status
            || self.size != other.size
            || self.update_date != other.update_date
    }
}

/// Derived per-address rollup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    /// Owning address; the row key.
    pub address: Address,
    /// Issuer associated with the address, or [`ISSUER_PLACEHOLDER`].
    #[serde(rename = "assoIssAddress")]
    pub issuer_address: String,
    /// Number of live files under the address.
    #[serde(rename = "nItems")]
    pub item_count: i64,
    /// Total bytes of live files under the address.
    #[serde(rename = "size")]
    pub total_size: i64,
    /// Earliest observation under the address.
    #[serde(with = "ts_milliseconds")]
    pub create_date: DateTime<Utc>,
    /// Latest change under the address.
    #[serde(with = "ts_milliseconds")]
    pub update_date: DateTime<Utc>,
}

impl BucketInfo {
    /// Returns true if any tracked field differs from `other`.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.item_count != other.item_count
            || self.total_size != other.total_size
            || self.update_date != other.update_date
            || self.issuer_address != other.issuer_address
    }
}

/// Aggregation cursor persisted after every successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Row key (ULID of the write).
    pub id: String,
    /// Keys of recently applied events at and around the watermark.
    #[serde(
        rename = "lastKeys",
        default,
        deserialize_with = "deserialize_processed_keys"
    )]
    pub processed_keys: Vec<String>,
    /// Events strictly older than this were all applied.
    #[serde(rename = "lastCreateDate", with = "ts_milliseconds")]
    pub watermark: DateTime<Utc>,
    /// When this checkpoint was written.
    #[serde(rename = "createDate", with = "ts_milliseconds")]
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// The checkpoint used when none has been written yet.
    #[must_use]
    pub fn zero() -> Self {
        Self {
            id: String::new(),
            processed_keys: Vec::new(),
            watermark: DateTime::<Utc>::UNIX_EPOCH,
            written_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Returns the processed keys as a set for membership checks.
    #[must_use]
    pub fn processed_key_set(&self) -> HashSet<&str> {
        self.processed_keys.iter().map(String::as_str).collect()
    }
}

/// Reads a processed-key list that may be a sequence or a delimited string.
///
/// Malformed values are logged and read as empty: a lost key list only means
/// events at the watermark are re-applied, which the change detection absorbs.
fn deserialize_processed_keys<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_processed_keys(&value))
}

/// Parses a processed-key list from its stored representation.
///
/// Accepts a JSON array of strings or integers, or a comma-delimited string.
#[must_use]
pub fn parse_processed_keys(value: &serde_json::Value) -> Vec<String> {
    use serde_json::Value;

    match value {
        Value::Null => Vec::new(),
        Value::String(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(key) => keys.push(key.clone()),
                    Value::Number(key) => keys.push(key.to_string()),
                    other => {
                        tracing::warn!(item = %other, "malformed checkpoint key list, ignoring it");
                        return Vec::new();
                    }
                }
            }
            keys
        }
        other => {
            tracing::warn!(value = %other, "malformed checkpoint key list, ignoring it");
            Vec::new()
        }
    }
}
