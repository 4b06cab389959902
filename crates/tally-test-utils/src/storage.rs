//! Document store wrappers for tests.
//!
//! - [`FailingDocumentStore`] injects read and commit failures.
//! - [`RecordingDocumentStore`] records every operation for assertions.
//!
//! Both wrap any [`DocumentStore`] and forward to it when not interfering.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tally_core::error::{Error, Result};
use tally_core::{Document, DocumentStore, Kind, Query, StoreLimits, Transaction};
use tally_core::store::Mutation;

/// Which commits should fail.
#[derive(Debug, Clone, Default)]
struct FailurePlan {
    /// Fail the commit with this 1-based index (counted from plan creation).
    commit_number: Option<usize>,
    /// Fail every commit that touches this kind.
    commit_kind: Option<Kind>,
    /// Fail every read of this kind.
    read_kind: Option<Kind>,
    /// Commits seen since the plan was set.
    commits_seen: usize,
}

/// Document store that fails on demand.
#[derive(Clone)]
pub struct FailingDocumentStore {
    inner: Arc<dyn DocumentStore>,
    plan: Arc<Mutex<FailurePlan>>,
}

impl std::fmt::Debug for FailingDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingDocumentStore")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl FailingDocumentStore {
    /// Wraps a store with no failures planned.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            plan: Arc::default(),
        }
    }

    /// Fails the `n`th commit from now (1-based), once.
    pub fn fail_commit_number(&self, n: usize) {
        let mut plan = self.plan.lock().expect("lock");
        plan.commit_number = Some(n);
        plan.commits_seen = 0;
    }

    /// Fails every commit containing a mutation of `kind`.
    pub fn fail_commits_touching(&self, kind: Kind) {
        self.plan.lock().expect("lock").commit_kind = Some(kind);
    }

    /// Fails every query and key lookup of `kind`.
    pub fn fail_reads_of(&self, kind: Kind) {
        self.plan.lock().expect("lock").read_kind = Some(kind);
    }

    /// Removes all planned failures.
    pub fn clear_failures(&self) {
        *self.plan.lock().expect("lock") = FailurePlan::default();
    }

    fn check_read(&self, kind: Kind) -> Result<()> {
        if self.plan.lock().expect("lock").read_kind == Some(kind) {
            return Err(Error::storage(format!("injected read failure for {kind}")));
        }
        Ok(())
    }

    fn check_commit(&self, tx: &Transaction) -> Result<()> {
        let mut plan = self.plan.lock().expect("lock");
        plan.commits_seen += 1;

        if plan.commit_number == Some(plan.commits_seen) {
            plan.commit_number = None;
            return Err(Error::storage(format!(
                "injected failure for commit #{}",
                plan.commits_seen
            )));
        }
        let touched = plan
            .commit_kind
            .filter(|kind| tx.mutations().iter().any(|m| m.target().kind == *kind));
        if let Some(kind) = touched {
            return Err(Error::TransactionConflict {
                message: format!("injected conflict on {kind}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FailingDocumentStore {
    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.check_read(query.kind)?;
        self.inner.query(query).await
    }

    async fn get_by_keys(&self, kind: Kind, keys: &[String]) -> Result<Vec<Document>> {
        self.check_read(kind)?;
        self.inner.get_by_keys(kind, keys).await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        self.check_commit(&tx)?;
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        self.inner.rollback(tx).await
    }
}

/// Record of a document store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A query.
    Query {
        /// Kind queried.
        kind: Kind,
        /// Limit requested.
        limit: Option<usize>,
    },
    /// A key lookup.
    GetByKeys {
        /// Kind read.
        kind: Kind,
        /// Number of keys requested.
        keys: usize,
    },
    /// A commit attempt.
    Commit {
        /// Saved documents, per kind, in order.
        saves: Vec<Kind>,
        /// Number of deletes.
        deletes: usize,
    },
    /// A discarded transaction.
    Rollback {
        /// Number of staged mutations dropped.
        mutations: usize,
    },
}

/// Document store that records every operation.
#[derive(Clone)]
pub struct RecordingDocumentStore {
    inner: Arc<dyn DocumentStore>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
}

impl std::fmt::Debug for RecordingDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDocumentStore")
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}

impl RecordingDocumentStore {
    /// Wraps a store.
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            operations: Arc::default(),
        }
    }

    /// Returns all recorded operations.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Number of commit attempts.
    pub fn commits(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, StoreOp::Commit { .. }))
            .count()
    }

    /// Number of discarded transactions.
    pub fn rollbacks(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, StoreOp::Rollback { .. }))
            .count()
    }

    /// Number of documents of `kind` saved across all commits.
    pub fn saves_of(&self, kind: Kind) -> usize {
        self.operations()
            .iter()
            .map(|op| match op {
                StoreOp::Commit { saves, .. } => saves.iter().filter(|k| **k == kind).count(),
                _ => 0,
            })
            .sum()
    }

    /// Largest number of mutations in a single commit.
    pub fn largest_commit(&self) -> usize {
        self.operations()
            .iter()
            .filter_map(|op| match op {
                StoreOp::Commit { saves, deletes } => Some(saves.len() + deletes),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }
}

#[async_trait]
impl DocumentStore for RecordingDocumentStore {
    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.record(StoreOp::Query {
            kind: query.kind,
            limit: query.limit,
        });
        self.inner.query(query).await
    }

    async fn get_by_keys(&self, kind: Kind, keys: &[String]) -> Result<Vec<Document>> {
        self.record(StoreOp::GetByKeys {
            kind,
            keys: keys.len(),
        });
        self.inner.get_by_keys(kind, keys).await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let mut saves = Vec::new();
        let mut deletes = 0;
        for mutation in tx.mutations() {
            match mutation {
                Mutation::Save(doc) => saves.push(doc.kind()),
                Mutation::Delete(_) => deletes += 1,
            }
        }
        self.record(StoreOp::Commit { saves, deletes });
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        self.record(StoreOp::Rollback {
            mutations: tx.len(),
        });
        self.inner.rollback(tx).await
    }
}
