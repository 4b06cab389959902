//! # tally-core
//!
//! Shared primitives for the tally file-log aggregation workers.
//!
//! - **Model**: log events, per-file and per-address summaries, checkpoints
//! - **Path grammar**: address extraction from file paths
//! - **Document store**: query/transaction trait with memory and `SQLite` backends
//! - **Blob store**: list/copy/delete trait with memory and local-filesystem backends
//! - **Observability**: logging initialization and run spans
//!
//! ## Example
//!
//! ```rust
//! use tally_core::prelude::*;
//!
//! let address = extract_address("addr/photos/a.jpg").unwrap();
//! assert_eq!(address.as_str(), "addr");
//! assert_eq!("moveFileDelStep".parse::<Action>().unwrap(), Action::Delete);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod blob;
pub mod document;
pub mod error;
pub mod model;
pub mod observability;
pub mod path;
pub mod sqlite;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tally_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::blob::{BlobMeta, BlobStore, LocalBlobStore, MemoryBlobStore};
    pub use crate::document::{Document, DocumentKey, Filter, Kind, Order, Query};
    pub use crate::error::{Error, Result};
    pub use crate::model::{
        Action, BucketInfo, Checkpoint, FileInfo, FileStatus, ISSUER_PLACEHOLDER, LogEvent,
    };
    pub use crate::path::{Address, extract_address};
    pub use crate::sqlite::SqliteDocumentStore;
    pub use crate::store::{
        DocumentStore, MemoryDocumentStore, Mutation, StoreLimits, Transaction, TransactionMode,
    };
}

// Re-export key types at crate root for ergonomics
pub use blob::{BlobMeta, BlobStore, LocalBlobStore, MemoryBlobStore};
pub use document::{Document, DocumentKey, Kind, Query};
pub use error::{Error, Result};
pub use model::{Action, BucketInfo, Checkpoint, FileInfo, FileStatus, LogEvent};
pub use observability::{LogFormat, init_logging, run_span};
pub use path::{Address, extract_address};
pub use sqlite::SqliteDocumentStore;
pub use store::{DocumentStore, MemoryDocumentStore, StoreLimits, Transaction, TransactionMode};
