//! Merging accumulators into stored summaries.
//!
//! Both functions return a fresh row when something tracked changed and
//! `None` otherwise, so unchanged rows are never rewritten.

use tally_core::model::ISSUER_PLACEHOLDER;
use tally_core::{Address, BucketInfo, FileInfo};

use crate::fold::{BucketAccumulator, FileAccumulator};

/// Replaces a file summary with the run's net effect.
///
/// A run that only deleted the path keeps the stored size.
#[must_use]
pub fn merge_file(path: &str, acc: &FileAccumulator, stored: Option<&FileInfo>) -> Option<FileInfo> {
    let size = acc
        .size
        .or_else(|| stored.map(|info| info.size))
        .unwrap_or(0);

    let merged = FileInfo {
        path: path.to_string(),
        status: acc.status,
        size,
        create_date: stored.map_or(acc.first_seen, |info| info.create_date),
        update_date: acc.last_seen,
    };

    match stored {
        Some(existing) if !merged.differs_from(existing) => None,
        _ => Some(merged),
    }
}

/// Adds the run's deltas onto an address rollup.
#[must_use]
pub fn merge_bucket(
    address: &Address,
    acc: &BucketAccumulator,
    stored: Option<&BucketInfo>,
) -> Option<BucketInfo> {
    let Some(existing) = stored else {
        return Some(BucketInfo {
            address: address.clone(),
            issuer_address: acc
                .issuer
                .clone()
                .unwrap_or_else(|| ISSUER_PLACEHOLDER.to_string()),
            item_count: acc.item_delta,
            total_size: acc.size_delta,
            create_date: acc.first_seen,
            update_date: acc.last_seen,
        });
    };

    let merged = BucketInfo {
        address: address.clone(),
        issuer_address: acc
            .issuer
            .clone()
            .unwrap_or_else(|| existing.issuer_address.clone()),
        item_count: existing.item_count.saturating_add(acc.item_delta),
        total_size: existing.total_size.saturating_add(acc.size_delta),
        create_date: existing.create_date,
        update_date: existing.update_date.max(acc.last_seen),
    };

    merged.differs_from(existing).then_some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tally_core::FileStatus;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn file_acc(status: FileStatus, size: Option<u64>, first: i64, last: i64) -> FileAccumulator {
        FileAccumulator {
            status,
            size,
            first_seen: at(first),
            last_seen: at(last),
        }
    }

    fn bucket_acc(items: i64, size: i64, issuer: Option<&str>, last: i64) -> BucketAccumulator {
        BucketAccumulator {
            issuer: issuer.map(str::to_string),
            item_delta: items,
            size_delta: size,
            first_seen: at(1),
            last_seen: at(last),
        }
    }

    #[test]
    fn new_file_row_uses_first_seen() {
        let merged = merge_file("a/1", &file_acc(FileStatus::Active, Some(10), 3, 8), None).unwrap();
        assert_eq!(merged.create_date, at(3));
        assert_eq!(merged.update_date, at(8));
        assert_eq!(merged.size, 10);
    }

    #[test]
    fn unchanged_file_is_not_rewritten() {
        let stored = FileInfo {
            path: "a/1".into(),
            status: FileStatus::Active,
            size: 10,
            create_date: at(1),
            update_date: at(8),
        };
        let acc = file_acc(FileStatus::Active, Some(10), 8, 8);
        assert!(merge_file("a/1", &acc, Some(&stored)).is_none());

        let acc = file_acc(FileStatus::Deleted, None, 9, 9);
        let merged = merge_file("a/1", &acc, Some(&stored)).unwrap();
        assert_eq!(merged.size, 10);
        assert_eq!(merged.create_date, at(1));
        assert_eq!(merged.status, FileStatus::Deleted);
    }

    #[test]
    fn bucket_deltas_add_onto_stored_values() {
        let address = Address::new("a").unwrap();
        let stored = BucketInfo {
            address: address.clone(),
            issuer_address: "issuer-1".into(),
            item_count: 4,
            total_size: 100,
            create_date: at(0),
            update_date: at(5),
        };

        let merged = merge_bucket(&address, &bucket_acc(1, 20, None, 9), Some(&stored)).unwrap();
        assert_eq!(merged.item_count, 5);
        assert_eq!(merged.total_size, 120);
        assert_eq!(merged.issuer_address, "issuer-1");
        assert_eq!(merged.create_date, at(0));
        assert_eq!(merged.update_date, at(9));
    }

    #[test]
    fn bucket_totals_saturate_instead_of_wrapping() {
        let address = Address::new("a").unwrap();
        let stored = BucketInfo {
            address: address.clone(),
            issuer_address: "n/a".into(),
            item_count: i64::MAX - 1,
            total_size: i64::MAX,
            create_date: at(0),
            update_date: at(5),
        };
        let merged = merge_bucket(&address, &bucket_acc(5, i64::MAX, None, 9), Some(&stored)).unwrap();
        assert_eq!(merged.item_count, i64::MAX);
        assert_eq!(merged.total_size, i64::MAX);
    }

    #[test]
    fn zero_delta_at_same_time_is_skipped() {
        let address = Address::new("a").unwrap();
        let stored = BucketInfo {
            address: address.clone(),
            issuer_address: "n/a".into(),
            item_count: 1,
            total_size: 1,
            create_date: at(0),
            update_date: at(5),
        };
        assert!(merge_bucket(&address, &bucket_acc(0, 0, None, 5), Some(&stored)).is_none());

        let merged = merge_bucket(&address, &bucket_acc(0, 0, Some("issuer-2"), 5), Some(&stored));
        assert_eq!(merged.unwrap().issuer_address, "issuer-2");
    }

    #[test]
    fn new_bucket_without_issuer_gets_placeholder() {
        let address = Address::new("a").unwrap();
        let merged = merge_bucket(&address, &bucket_acc(0, 0, None, 5), None).unwrap();
        assert_eq!(merged.issuer_address, ISSUER_PLACEHOLDER);
        assert_eq!(merged.item_count, 0);
    }
}
