//! Shared test utilities for tally integration tests.
//!
//! This crate provides:
//! - [`FailingDocumentStore`]: failure injection around any document store
//! - [`RecordingDocumentStore`]: operation recording for write assertions
//! - [`TestContext`]: memory stores wired for a test
//! - Builders for log events and summaries
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_test_utils::{TestContext, create};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     ctx.log([create("k1", "a/1", 10, 1_000)]);
//!     // ... run a job against ctx.doc_store() ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities panic on setup errors
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tally=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
