//! # tally-engine
//!
//! Jobs that keep the file summaries in step with the file log and the blob
//! buckets:
//!
//! - [`AggregationEngine`]: incremental fold of new log events, resumable
//!   through an append-only watermark checkpoint
//! - [`ReconciliationEngine`]: full rebuild from the primary and backup buckets
//! - [`AddressAuditor`]: read-only consistency check of one address
//! - [`Purger`]: removal of deleted files and expired log events
//!
//! All jobs take their stores as `Arc<dyn …>` and return a serializable report.
//!
//! ## Example
//!
//! ```rust
//! # async fn example() -> tally_engine::Result<()> {
//! use std::sync::Arc;
//! use tally_core::MemoryDocumentStore;
//! use tally_engine::{AggregationEngine, EngineConfig};
//!
//! let docs = Arc::new(MemoryDocumentStore::new());
//! let engine = AggregationEngine::new(docs, EngineConfig::default())?;
//! let report = engine.run().await?;
//! println!("applied {} events", report.events_applied);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregation;
pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fold;
pub mod merge;
pub mod metrics;
pub mod purge;
pub mod reconciler;
pub mod store;

pub use aggregation::{AggregationEngine, AggregationReport};
pub use audit::{AddressAuditor, AuditFinding, AuditReport, FindingKind};
pub use checkpoint::{CheckpointManager, next_checkpoint};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use purge::{PurgeReport, Purger};
pub use reconciler::{
    IssueType, ReconciliationEngine, ReconciliationIssue, ReconciliationReport, Severity,
};
pub use store::SummaryStore;
