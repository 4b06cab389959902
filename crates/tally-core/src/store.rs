//! Document store abstraction.
//!
//! The contract mirrors a transactional document database:
//!
//! - `query` with equality/range filters, ordering, limit and offset
//! - `get_by_keys` for batched point reads
//! - buffered transactions: mutations are staged on a [`Transaction`] and
//!   applied all-or-nothing by [`DocumentStore::commit`]
//!
//! Providers cap how much a single call may touch. Callers are responsible for
//! chunking to [`StoreLimits`]; stores reject oversized calls with
//! [`Error::LimitExceeded`] instead of truncating silently.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use ulid::Ulid;

use crate::document::{Document, DocumentKey, Kind, Query};
use crate::error::{Error, Result};

/// Default maximum number of mutations in one commit.
pub const DEFAULT_MAX_MUTATIONS_PER_COMMIT: usize = 64;

/// Default maximum number of documents returned by one read.
pub const DEFAULT_MAX_FETCH: usize = 3200;

/// Per-call limits enforced by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum mutations applied by one commit.
    pub max_mutations_per_commit: usize,
    /// Maximum documents read by one query or key lookup.
    pub max_fetch: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_mutations_per_commit: DEFAULT_MAX_MUTATIONS_PER_COMMIT,
            max_fetch: DEFAULT_MAX_FETCH,
        }
    }
}

impl StoreLimits {
    /// Checks a query's limit against the fetch cap.
    ///
    /// # Errors
    ///
    /// Returns an error for unbounded queries or limits above the cap.
    pub fn check_query(&self, query: &Query) -> Result<usize> {
        let Some(limit) = query.limit else {
            return Err(Error::InvalidInput(format!(
                "unbounded {} query; set a limit of at most {}",
                query.kind, self.max_fetch
            )));
        };
        self.check_fetch("query", limit)?;
        Ok(limit)
    }

    /// Checks a read size against the fetch cap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitExceeded`] if `requested` is above the cap.
    pub fn check_fetch(&self, operation: &'static str, requested: usize) -> Result<()> {
        if requested > self.max_fetch {
            return Err(Error::LimitExceeded {
                operation,
                requested,
                limit: self.max_fetch,
            });
        }
        Ok(())
    }

    /// Checks a transaction's size against the commit cap.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitExceeded`] if the transaction is too large.
    pub fn check_commit(&self, tx: &Transaction) -> Result<()> {
        if tx.len() > self.max_mutations_per_commit {
            return Err(Error::LimitExceeded {
                operation: "commit",
                requested: tx.len(),
                limit: self.max_mutations_per_commit,
            });
        }
        Ok(())
    }
}

/// Transaction access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Mutations allowed.
    ReadWrite,
    /// Mutations rejected.
    ReadOnly,
}

/// A staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Insert or replace a document.
    Save(Document),
    /// Remove a document (no-op if absent).
    Delete(DocumentKey),
}

impl Mutation {
    /// Returns the key the mutation targets.
    #[must_use]
    pub fn target(&self) -> DocumentKey {
        match self {
            Self::Save(doc) => DocumentKey::new(doc.kind(), doc.key()),
            Self::Delete(key) => key.clone(),
        }
    }
}

/// A unit of work applied atomically on commit.
///
/// Nothing is visible to readers until [`DocumentStore::commit`] succeeds.
/// Dropping a transaction (or passing it to [`DocumentStore::rollback`])
/// discards its mutations.
#[derive(Debug)]
pub struct Transaction {
    id: Ulid,
    mode: TransactionMode,
    mutations: Vec<Mutation>,
}

impl Transaction {
    /// Starts an empty transaction.
    #[must_use]
    pub fn new(mode: TransactionMode) -> Self {
        Self {
            id: Ulid::new(),
            mode,
            mutations: Vec::new(),
        }
    }

    /// Returns the transaction ID (for logs).
    #[must_use]
    pub const fn id(&self) -> Ulid {
        self.id
    }

    /// Returns the access mode.
    #[must_use]
    pub const fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Stages an upsert.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is read-only.
    pub fn save(&mut self, doc: impl Into<Document>) -> Result<()> {
        self.ensure_writable()?;
        self.mutations.push(Mutation::Save(doc.into()));
        Ok(())
    }

    /// Stages a delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is read-only.
    pub fn delete(&mut self, key: DocumentKey) -> Result<()> {
        self.ensure_writable()?;
        self.mutations.push(Mutation::Delete(key));
        Ok(())
    }

    /// Returns the staged mutations in order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Consumes the transaction, returning its mutations.
    #[must_use]
    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    /// Number of staged mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::InvalidInput(format!(
                "transaction {} is read-only",
                self.id
            )));
        }
        Ok(())
    }
}

/// Document store trait.
///
/// All stores (SQLite, memory) implement this trait. Stores are shared as
/// `Arc<dyn DocumentStore>` and injected into the engines.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Returns the per-call limits this store enforces.
    fn limits(&self) -> StoreLimits;

    /// Runs a query.
    ///
    /// Rows that do not decode as the queried kind are logged and skipped.
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Fetches documents by key. Missing keys are absent from the result.
    async fn get_by_keys(&self, kind: Kind, keys: &[String]) -> Result<Vec<Document>>;

    /// Starts a transaction.
    fn begin_transaction(&self, mode: TransactionMode) -> Transaction {
        Transaction::new(mode)
    }

    /// Applies every mutation of `tx` atomically.
    ///
    /// On error no mutation is visible.
    async fn commit(&self, tx: Transaction) -> Result<()>;

    /// Discards a transaction.
    async fn rollback(&self, tx: Transaction) -> Result<()> {
        tracing::debug!(tx = %tx.id(), discarded = tx.len(), "transaction rolled back");
        Ok(())
    }
}

/// Decodes a stored body, logging and skipping rows that do not fit the schema.
pub(crate) fn decode_row(kind: Kind, key: &str, body: JsonValue) -> Option<Document> {
    match Document::from_json(kind, body) {
        Ok(doc) => Some(doc),
        Err(e) => {
            tracing::warn!(kind = %kind, key = %key, error = %e, "skipping undecodable document");
            None
        }
    }
}

/// In-memory document store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<BTreeMap<DocumentKey, JsonValue>>,
    limits: StoreLimits,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryDocumentStore {
    /// Creates an empty store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store with custom limits.
    #[must_use]
    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            documents: RwLock::default(),
            limits,
        }
    }

    /// Inserts documents directly, bypassing transaction limits (test seeding).
    ///
    /// # Errors
    ///
    /// Returns an error if a document cannot be serialized.
    pub fn seed<I, D>(&self, docs: I) -> Result<()>
    where
        I: IntoIterator<Item = D>,
        D: Into<Document>,
    {
        let mut documents = self.documents.write().map_err(poison_err)?;
        for doc in docs {
            let doc = doc.into();
            let key = DocumentKey::new(doc.kind(), doc.key());
            documents.insert(key, doc.to_json()?);
        }
        Ok(())
    }

    /// Inserts a raw body, bypassing schema checks (for malformed-row tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn seed_raw(&self, kind: Kind, key: &str, body: JsonValue) -> Result<()> {
        self.documents
            .write()
            .map_err(poison_err)?
            .insert(DocumentKey::new(kind, key), body);
        Ok(())
    }

    /// Number of documents of a kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn count(&self, kind: Kind) -> Result<usize> {
        let documents = self.documents.read().map_err(poison_err)?;
        Ok(documents.keys().filter(|k| k.kind == kind).count())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        let limit = self.limits.check_query(query)?;

        let mut rows: Vec<(String, JsonValue)> = {
            let documents = self.documents.read().map_err(poison_err)?;
            documents
                .iter()
                .filter(|(key, _)| key.kind == query.kind)
                .filter(|(_, body)| query.filter.as_ref().is_none_or(|f| f.matches(body)))
                .map(|(key, body)| (key.key.clone(), body.clone()))
                .collect()
        };
        rows.sort_by(|(_, a), (_, b)| query.compare(a, b));

        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .filter_map(|(key, body)| decode_row(query.kind, &key, body))
            .collect())
    }

    async fn get_by_keys(&self, kind: Kind, keys: &[String]) -> Result<Vec<Document>> {
        self.limits.check_fetch("get_by_keys", keys.len())?;

        let rows: Vec<(String, JsonValue)> = {
            let documents = self.documents.read().map_err(poison_err)?;
            keys.iter()
                .filter_map(|key| {
                    documents
                        .get(&DocumentKey::new(kind, key.as_str()))
                        .map(|body| (key.clone(), body.clone()))
                })
                .collect()
        };

        Ok(rows
            .into_iter()
            .filter_map(|(key, body)| decode_row(kind, &key, body))
            .collect())
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        self.limits.check_commit(&tx)?;

        // Serialize everything before taking the lock so a bad document
        // cannot leave a half-applied batch behind.
        let mut staged = Vec::with_capacity(tx.len());
        for mutation in tx.into_mutations() {
            match mutation {
                Mutation::Save(doc) => {
                    let key = DocumentKey::new(doc.kind(), doc.key());
                    staged.push((key, Some(doc.to_json()?)));
                }
                Mutation::Delete(key) => staged.push((key, None)),
            }
        }

        let mut documents = self.documents.write().map_err(poison_err)?;
        for (key, body) in staged {
            match body {
                Some(body) => {
                    documents.insert(key, body);
                }
                None => {
                    documents.remove(&key);
                }
            }
        }
        drop(documents);
        Ok(())
    }
}
