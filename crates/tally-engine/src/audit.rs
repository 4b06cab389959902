//! Read-only consistency audit of a single address.
//!
//! Compares the objects under `address/` in both buckets with the address's
//! `FileInfo` rows and its `BucketInfo` rollup. Nothing is written; the
//! report is meant for an operator deciding whether to run reconciliation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{Address, BlobMeta, BlobStore, BucketInfo, DocumentStore, FileInfo, FileStatus};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::store::SummaryStore;

/// What an audit finding is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Primary object with no backup copy.
    MissingBackup,
    /// Primary object with no `FileInfo`.
    MissingFileInfo,
    /// `FileInfo` of a primary object is not Active or has the wrong size.
    FileInfoMismatch,
    /// Backup-only object whose `FileInfo` is missing or not Deleted.
    DeletedFileMismatch,
    /// `FileInfo` with no object in either bucket.
    UntrackedFileInfo,
    /// Address has primary objects but no `BucketInfo`.
    MissingBucketInfo,
    /// `BucketInfo` count or size differs from the primary listing.
    BucketInfoMismatch,
}

/// One audit finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFinding {
    /// Finding kind.
    pub kind: FindingKind,
    /// Affected path (or the address for rollup findings).
    pub subject: String,
    /// Human-readable description.
    pub description: String,
}

/// Result of auditing one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    /// Audited address.
    pub address: Address,
    /// When the audit ran.
    pub checked_at: DateTime<Utc>,
    /// Objects under the address in the primary bucket.
    pub primary_objects: usize,
    /// Objects under the address in the backup bucket.
    pub backup_objects: usize,
    /// `FileInfo` rows under the address.
    pub file_infos: usize,
    /// Item count computed from the primary listing.
    pub expected_items: i64,
    /// Total size computed from the primary listing.
    pub expected_size: i64,
    /// The stored rollup, if any.
    pub bucket_info: Option<BucketInfo>,
    /// Inconsistencies found.
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Returns true if nothing was found.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }

    /// Returns findings of one kind.
    #[must_use]
    pub fn findings_of_kind(&self, kind: FindingKind) -> Vec<&AuditFinding> {
        self.findings.iter().filter(|f| f.kind == kind).collect()
    }
}

/// Audits addresses without modifying anything.
#[derive(Clone)]
pub struct AddressAuditor {
    store: SummaryStore,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
}

impl fmt::Debug for AddressAuditor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressAuditor")
            .field("store", &self.store)
            .field("blobs", &"BlobStore")
            .field("config", &self.config)
            .finish()
    }
}

impl AddressAuditor {
    /// Creates an auditor.
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

    /// Audits one address.
    ///
    /// # Errors
    ///
    /// Returns an error if a listing or read fails.
    pub async fn check(&self, address: &Address) -> Result<AuditReport> {
        let prefix = address.path_prefix();
        let primary = self.blobs.list(&self.config.primary_bucket, &prefix).await?;
        let backup = self.blobs.list(&self.config.backup_bucket, &prefix).await?;
        let file_infos = self.store.file_infos_under(address).await?;
        let bucket_info = self.store.bucket_info(address).await?;

        let findings_input = AuditInput {
            primary: &primary,
            backup: &backup,
            file_infos: &file_infos,
        };
        let mut findings = findings_input.object_findings();

        let expected_items = i64::try_from(primary.len()).unwrap_or(i64::MAX);
        let expected_size = primary
            .iter()
            .map(|o| i64::try_from(o.size).unwrap_or(i64::MAX))
            .fold(0_i64, i64::saturating_add);
        match &bucket_info {
            None if !primary.is_empty() => findings.push(AuditFinding {
                kind: FindingKind::MissingBucketInfo,
                subject: address.to_string(),
                description: format!(
                    "no BucketInfo for {expected_items} primary objects ({expected_size} bytes)"
                ),
            }),
            Some(info) if info.item_count != expected_items || info.total_size != expected_size => {
                findings.push(AuditFinding {
                    kind: FindingKind::BucketInfoMismatch,
                    subject: address.to_string(),
                    description: format!(
                        "BucketInfo has {} items / {} bytes, primary has {expected_items} / {expected_size}",
                        info.item_count, info.total_size
                    ),
                });
            }
            _ => {}
        }

        let report = AuditReport {
            address: address.clone(),
            checked_at: Utc::now(),
            primary_objects: primary.len(),
            backup_objects: backup.len(),
            file_infos: file_infos.len(),
            expected_items,
            expected_size,
            bucket_info,
            findings,
        };

        tracing::info!(
            address = %address,
            primary_objects = report.primary_objects,
            backup_objects = report.backup_objects,
            file_infos = report.file_infos,
            findings = report.findings.len(),
            "address audit complete"
        );
        Ok(report)
    }
}

struct AuditInput<'a> {
    primary: &'a [BlobMeta],
    backup: &'a [BlobMeta],
    file_infos: &'a [FileInfo],
}

impl AuditInput<'_> {
    fn object_findings(&self) -> Vec<AuditFinding> {
        let backup_paths: HashSet<&str> = self.backup.iter().map(|o| o.path.as_str()).collect();
        let primary_paths: HashSet<&str> = self.primary.iter().map(|o| o.path.as_str()).collect();
        let infos: HashMap<&str, &FileInfo> = self
            .file_infos
            .iter()
            .map(|info| (info.path.as_str(), info))
            .collect();

        let mut findings = Vec::new();
        let mut push = |kind, subject: &str, description: String| {
            findings.push(AuditFinding {
                kind,
                subject: subject.to_string(),
                description,
            });
        };

        for object in self.primary {
            if !backup_paths.contains(object.path.as_str()) {
                push(FindingKind::MissingBackup, &object.path, "primary object has no backup copy".into());
            }
            match infos.get(object.path.as_str()) {
                None => push(FindingKind::MissingFileInfo, &object.path, "primary object has no FileInfo".into()),
                Some(info) if info.status != FileStatus::Active || info.size != object.size => push(
                    FindingKind::FileInfoMismatch,
                    &object.path,
                    format!(
                        "FileInfo is {} / {} bytes, primary object is Active / {} bytes",
                        info.status, info.size, object.size
                    ),
                ),
                Some(_) => {}
            }
        }

        for object in self.backup.iter().filter(|o| !primary_paths.contains(o.path.as_str())) {
            match infos.get(object.path.as_str()) {
                Some(info) if info.status == FileStatus::Deleted => {}
                Some(info) => push(
                    FindingKind::DeletedFileMismatch,
                    &object.path,
                    format!("backup-only object but FileInfo is {}", info.status),
                ),
                None => push(
                    FindingKind::DeletedFileMismatch,
                    &object.path,
                    "backup-only object has no FileInfo".into(),
                ),
            }
        }

        for info in self.file_infos {
            let path = info.path.as_str();
            if !primary_paths.contains(path) && !backup_paths.contains(path) {
                push(FindingKind::UntrackedFileInfo, path, "FileInfo has no object in either bucket".into());
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn object(path: &str, size: u64) -> BlobMeta {
        BlobMeta {
            path: path.into(),
            size,
            created_at: at(1),
            updated_at: at(1),
        }
    }

    fn info(path: &str, status: FileStatus, size: u64) -> FileInfo {
        FileInfo {
            path: path.into(),
            status,
            size,
            create_date: at(1),
            update_date: at(1),
        }
    }

    #[test]
    fn consistent_address_has_no_object_findings() {
        let primary = [object("a/1", 3)];
        let backup = [object("a/1", 3), object("a/gone", 2)];
        let infos = [info("a/1", FileStatus::Active, 3), info("a/gone", FileStatus::Deleted, 2)];
        let input = AuditInput {
            primary: &primary,
            backup: &backup,
            file_infos: &infos,
        };
        assert!(input.object_findings().is_empty());
    }

    #[test]
    fn every_object_rule_fires() {
        let primary = [object("a/1", 3), object("a/2", 4)];
        let backup = [object("a/2", 4), object("a/gone", 2)];
        let infos = [
            info("a/2", FileStatus::Deleted, 4),
            info("a/gone", FileStatus::Active, 2),
            info("a/ghost", FileStatus::Active, 1),
        ];
        let input = AuditInput {
            primary: &primary,
            backup: &backup,
            file_infos: &infos,
        };
        let kinds: Vec<_> = input.object_findings().into_iter().map(|f| (f.kind, f.subject)).collect();

        assert!(kinds.contains(&(FindingKind::MissingBackup, "a/1".into())));
        assert!(kinds.contains(&(FindingKind::MissingFileInfo, "a/1".into())));
        assert!(kinds.contains(&(FindingKind::FileInfoMismatch, "a/2".into())));
        assert!(kinds.contains(&(FindingKind::DeletedFileMismatch, "a/gone".into())));
        assert!(kinds.contains(&(FindingKind::UntrackedFileInfo, "a/ghost".into())));
        assert_eq!(kinds.len(), 5);
    }
}
