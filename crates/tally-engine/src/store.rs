//! Typed access to the summary tables.
//!
//! [`SummaryStore`] wraps a [`DocumentStore`] with the reads and writes the
//! jobs need, and owns the chunking discipline: keyed reads are split at the
//! fetch limit, full scans page at the fetch limit, and writes are committed
//! in batches of `write_batch_size`, one transaction per batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::document::{Filter, Order};
use tally_core::{
    Address, BucketInfo, Checkpoint, Document, DocumentKey, DocumentStore, FileInfo, FileStatus,
    Kind, LogEvent, Query, Transaction, TransactionMode,
};

use crate::config::EngineConfig;
use crate::error::Result;

/// Typed summary-table access over a shared document store.
#[derive(Clone)]
pub struct SummaryStore {
    docs: Arc<dyn DocumentStore>,
    fetch_limit: usize,
    write_batch_size: usize,
}

impl fmt::Debug for SummaryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummaryStore")
            .field("docs", &"DocumentStore")
            .field("fetch_limit", &self.fetch_limit)
            .field("write_batch_size", &self.write_batch_size)
            .finish()
    }
}

impl SummaryStore {
    /// Creates a summary store using the config's chunk sizes.
    #[must_use]
    pub fn new(docs: Arc<dyn DocumentStore>, config: &EngineConfig) -> Self {
        Self {
            docs,
            fetch_limit: config.fetch_limit.max(1),
            write_batch_size: config.write_batch_size.max(1),
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Returns the authoritative checkpoint: greatest watermark, then newest write.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let query = Query::new(Kind::FileWorkLog)
            .order(Order::desc("lastCreateDate"))
            .order(Order::desc("createDate"))
            .limit(1);
        Ok(self
            .docs
            .query(&query)
            .await?
            .into_iter()
            .find_map(|doc| match doc {
                Document::Checkpoint(checkpoint) => Some(checkpoint),
                _ => None,
            }))
    }

    /// Appends a checkpoint row.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut tx = self.docs.begin_transaction(TransactionMode::ReadWrite);
        tx.save(checkpoint.clone())?;
        self.docs.commit(tx).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Log events
    // ------------------------------------------------------------------

    /// Fetches up to `limit` events with `createDate >= since`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn log_events_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LogEvent>> {
        self.log_events_since_page(since, limit, 0).await
    }

    /// Like [`Self::log_events_since`], skipping the first `offset` matches.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn log_events_since_page(
        &self,
        since: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LogEvent>> {
        let query = Query::new(Kind::FileLog)
            .filter(Filter::gte("createDate", since))
            .order(Order::asc("createDate"))
            .limit(limit)
            .offset(offset);
        Ok(self.docs.query(&query).await?.into_iter().filter_map(into_log_event).collect())
    }

    /// Fetches the `count` newest events, returned oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn latest_log_events(&self, count: usize) -> Result<Vec<LogEvent>> {
        let query = Query::new(Kind::FileLog)
            .order(Order::desc("createDate"))
            .limit(count);
        let mut events: Vec<LogEvent> = self
            .docs
            .query(&query)
            .await?
            .into_iter()
            .filter_map(into_log_event)
            .collect();
        events.reverse();
        Ok(events)
    }

    /// Fetches up to `limit` events older than `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn log_events_before(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<LogEvent>> {
        let query = Query::new(Kind::FileLog)
            .filter(Filter::lt("createDate", cutoff))
            .order(Order::asc("createDate"))
            .limit(limit);
        Ok(self.docs.query(&query).await?.into_iter().filter_map(into_log_event).collect())
    }

    // ------------------------------------------------------------------
    // Summaries
    // ------------------------------------------------------------------

    /// Loads file summaries by path, chunked at the fetch limit.
    ///
    /// # Errors
    ///
    /// Returns an error if any read fails.
    pub async fn file_infos_by_paths(&self, paths: &[String]) -> Result<HashMap<String, FileInfo>> {
        let mut found = HashMap::with_capacity(paths.len());
        for chunk in paths.chunks(self.fetch_limit) {
            for doc in self.docs.get_by_keys(Kind::FileInfo, chunk).await? {
                if let Document::FileInfo(info) = doc {
                    found.insert(info.path.clone(), info);
                }
            }
        }
        Ok(found)
    }

    /// Loads address rollups by address, chunked at the fetch limit.
    ///
    /// # Errors
    ///
    /// Returns an error if any read fails.
    pub async fn bucket_infos_by_addresses(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, BucketInfo>> {
        let keys: Vec<String> = addresses.iter().map(|a| a.as_str().to_string()).collect();
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.fetch_limit) {
            for doc in self.docs.get_by_keys(Kind::BucketInfo, chunk).await? {
                if let Document::BucketInfo(info) = doc {
                    found.insert(info.address.clone(), info);
                }
            }
        }
        Ok(found)
    }

    /// Loads one address rollup.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn bucket_info(&self, address: &Address) -> Result<Option<BucketInfo>> {
        Ok(self
            .bucket_infos_by_addresses(std::slice::from_ref(address))
            .await?
            .remove(address))
    }

    /// Loads every file summary.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails to load.
    pub async fn all_file_infos(&self) -> Result<Vec<FileInfo>> {
        let docs = self.query_all(Query::new(Kind::FileInfo)).await?;
        Ok(docs.into_iter().filter_map(into_file_info).collect())
    }

    /// Loads every address rollup.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails to load.
    pub async fn all_bucket_infos(&self) -> Result<Vec<BucketInfo>> {
        let docs = self.query_all(Query::new(Kind::BucketInfo)).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match doc {
                Document::BucketInfo(info) => Some(info),
                _ => None,
            })
            .collect())
    }

    /// Loads the file summaries of paths owned by `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails to load.
    pub async fn file_infos_under(&self, address: &Address) -> Result<Vec<FileInfo>> {
        let query = Query::new(Kind::FileInfo).filter(
            Filter::gte("path", address.path_prefix())
                .and(Filter::lt("path", address.path_upper_bound())),
        );
        let docs = self.query_all(query).await?;
        Ok(docs.into_iter().filter_map(into_file_info).collect())
    }

    /// Loads every file summary with status `Deleted`.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails to load.
    pub async fn deleted_file_infos(&self) -> Result<Vec<FileInfo>> {
        let query =
            Query::new(Kind::FileInfo).filter(Filter::eq("status", FileStatus::Deleted.as_str()));
        let docs = self.query_all(query).await?;
        Ok(docs.into_iter().filter_map(into_file_info).collect())
    }

    /// Pages through a query at the fetch limit until an empty page.
    ///
    /// Offsets advance by the page size requested rather than the rows decoded,
    /// so rows the store skipped as undecodable do not shift later pages.
    async fn query_all(&self, query: Query) -> Result<Vec<Document>> {
        let mut docs = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .docs
                .query(&query.clone().limit(self.fetch_limit).offset(offset))
                .await?;
            if page.is_empty() {
                break;
            }
            docs.extend(page);
            offset += self.fetch_limit;
        }
        Ok(docs)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Upserts documents in batches, one transaction per batch.
    ///
    /// Returns the number of documents written. A failed batch aborts the
    /// remaining ones; batches already committed stay committed.
    ///
    /// # Errors
    ///
    /// Returns the first commit error.
    pub async fn save_all<D>(&self, docs: Vec<D>) -> Result<usize>
    where
        D: Into<Document>,
    {
        let docs: Vec<Document> = docs.into_iter().map(Into::into).collect();
        let mut written = 0;
        for chunk in docs.chunks(self.write_batch_size) {
            let mut tx = self.docs.begin_transaction(TransactionMode::ReadWrite);
            for doc in chunk {
                tx.save(doc.clone())?;
            }
            if let Err(e) = self.commit_batch(tx).await {
                tracing::error!(written, error = %e, "batch commit failed");
                return Err(e);
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// Deletes documents in batches, one transaction per batch.
    ///
    /// # Errors
    ///
    /// Returns the first commit error.
    pub async fn delete_all(&self, keys: Vec<DocumentKey>) -> Result<usize> {
        let mut deleted = 0;
        for chunk in keys.chunks(self.write_batch_size) {
            let mut tx = self.docs.begin_transaction(TransactionMode::ReadWrite);
            for key in chunk {
                tx.delete(key.clone())?;
            }
            self.commit_batch(tx).await?;
            deleted += chunk.len();
        }
        Ok(deleted)
    }

    /// Commits one staged batch, rolling it back unsent if it exceeds the
    /// store's commit cap.
    async fn commit_batch(&self, tx: Transaction) -> Result<()> {
        if let Err(e) = self.docs.limits().check_commit(&tx) {
            tracing::warn!(tx = %tx.id(), mutations = tx.len(), error = %e, "batch over commit cap");
            self.docs.rollback(tx).await?;
            return Err(e.into());
        }
        self.docs.commit(tx).await?;
        Ok(())
    }
}

fn into_log_event(doc: Document) -> Option<LogEvent> {
    match doc {
        Document::FileLog(event) => Some(event),
        _ => None,
    }
}

fn into_file_info(doc: Document) -> Option<FileInfo> {
    match doc {
        Document::FileInfo(info) => Some(info),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{MemoryDocumentStore, StoreLimits};

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn info(path: &str, status: FileStatus) -> FileInfo {
        FileInfo {
            path: path.into(),
            status,
            size: 1,
            create_date: at(1),
            update_date: at(1),
        }
    }

    fn checkpoint(id: &str, watermark: i64, written_at: i64) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            processed_keys: vec![],
            watermark: at(watermark),
            written_at: at(written_at),
        }
    }

    fn store_with(config: &EngineConfig) -> (Arc<MemoryDocumentStore>, SummaryStore) {
        let docs = Arc::new(MemoryDocumentStore::new());
        let store = SummaryStore::new(docs.clone(), config);
        (docs, store)
    }

    #[tokio::test]
    async fn latest_checkpoint_prefers_watermark_then_write_time() {
        let (docs, store) = store_with(&EngineConfig::default());
        assert!(store.latest_checkpoint().await.unwrap().is_none());

        docs.seed([
            checkpoint("a", 5, 100),
            checkpoint("b", 7, 50),
            checkpoint("c", 7, 60),
            checkpoint("d", 6, 200),
        ])
        .unwrap();

        let latest = store.latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(latest.id, "c");
    }

    #[tokio::test]
    async fn save_all_commits_one_transaction_per_batch() {
        let config = EngineConfig {
            write_batch_size: 2,
            ..EngineConfig::default()
        };
        let docs = Arc::new(MemoryDocumentStore::with_limits(StoreLimits {
            max_mutations_per_commit: 2,
            max_fetch: 3200,
        }));
        let store = SummaryStore::new(docs.clone(), &config);

        let infos: Vec<_> = (0..5)
            .map(|i| info(&format!("a/{i}"), FileStatus::Active))
            .collect();
        assert_eq!(store.save_all(infos).await.unwrap(), 5);
        assert_eq!(docs.count(Kind::FileInfo).unwrap(), 5);
    }

    #[tokio::test]
    async fn oversized_batch_is_rolled_back_without_committing() {
        let config = EngineConfig {
            write_batch_size: 3,
            ..EngineConfig::default()
        };
        let memory = Arc::new(MemoryDocumentStore::with_limits(StoreLimits {
            max_mutations_per_commit: 2,
            max_fetch: 3200,
        }));
        let recording = Arc::new(tally_test_utils::RecordingDocumentStore::new(memory.clone()));
        let store = SummaryStore::new(recording.clone(), &config);

        let infos: Vec<_> = (0..3)
            .map(|i| info(&format!("a/{i}"), FileStatus::Active))
            .collect();
        let err = store.save_all(infos).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Core(tally_core::Error::LimitExceeded { .. })
        ));
        assert_eq!(recording.rollbacks(), 1);
        assert_eq!(recording.commits(), 0);
        assert_eq!(memory.count(Kind::FileInfo).unwrap(), 0);

        let keys = vec![DocumentKey::new(Kind::FileInfo, "a/0"); 3];
        assert!(store.delete_all(keys).await.is_err());
        assert_eq!(recording.rollbacks(), 2);
    }

    #[tokio::test]
    async fn keyed_reads_chunk_at_fetch_limit() {
        let config = EngineConfig {
            fetch_limit: 2,
            ..EngineConfig::default()
        };
        let docs = Arc::new(MemoryDocumentStore::with_limits(StoreLimits {
            max_mutations_per_commit: 64,
            max_fetch: 2,
        }));
        let store = SummaryStore::new(docs.clone(), &config);
        docs.seed((0..5).map(|i| info(&format!("a/{i}"), FileStatus::Active)))
            .unwrap();

        let paths: Vec<String> = (0..6).map(|i| format!("a/{i}")).collect();
        let found = store.file_infos_by_paths(&paths).await.unwrap();
        assert_eq!(found.len(), 5);

        let all = store.all_file_infos().await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn address_scoped_and_deleted_reads() {
        let (docs, store) = store_with(&EngineConfig::default());
        docs.seed([
            info("abc/1", FileStatus::Active),
            info("abc/2", FileStatus::Deleted),
            info("abcd/1", FileStatus::Deleted),
        ])
        .unwrap();

        let address = Address::new("abc").unwrap();
        let under: Vec<_> = store
            .file_infos_under(&address)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert_eq!(under, vec!["abc/1", "abc/2"]);

        let deleted = store.deleted_file_infos().await.unwrap();
        assert_eq!(deleted.len(), 2);
    }

    #[tokio::test]
    async fn latest_log_events_come_back_oldest_first() {
        let (docs, store) = store_with(&EngineConfig::default());
        let events = (0..5).map(|i| LogEvent {
            key: format!("k{i}"),
            path: "a/1".into(),
            issuer_address: None,
            action: "Update".into(),
            size: Some(1),
            size_change: 0,
            create_date: at(i * 10),
        });
        docs.seed(events).unwrap();

        let latest: Vec<_> = store
            .latest_log_events(3)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(latest, vec!["k2", "k3", "k4"]);

        let old = store.log_events_before(at(20), 10).await.unwrap();
        assert_eq!(old.len(), 2);
    }
}
