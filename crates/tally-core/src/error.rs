//! Error types and result aliases for tally.
//!
//! Errors are split by how a run must react to them:
//!
//! - **Transient** (`Storage`, `TransactionConflict`, `LimitExceeded`): abort the
//!   current run; the next scheduled invocation re-derives from the last checkpoint.
//! - **Data** (`InvalidPath`, `UnknownAction`, `Serialization`): the offending
//!   record is skipped by the caller and the run continues.

use std::fmt;

/// The result type used throughout tally.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A file path did not match the `address/remainder` grammar.
    #[error("invalid path '{path}': {message}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// Why the path was rejected.
        message: String,
    },

    /// A log event carried an action value outside the known set.
    #[error("unrecognized action: {0}")]
    UnknownAction(String),

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transaction could not be committed because of a concurrent writer.
    #[error("transaction conflict: {message}")]
    TransactionConflict {
        /// Description of the conflict.
        message: String,
    },

    /// A batch exceeded a provider limit (mutations per commit, keys per read).
    #[error("{operation} of {requested} items exceeds the limit of {limit}")]
    LimitExceeded {
        /// The operation that was attempted.
        operation: &'static str,
        /// Number of items requested.
        requested: usize,
        /// Maximum number of items allowed.
        limit: usize,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invalid path error.
    #[must_use]
    pub fn invalid_path(path: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Returns true if the error is tied to a single bad record rather than the store.
    ///
    /// Callers skip the record and keep going on data errors.
    #[must_use]
    pub const fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. } | Self::UnknownAction(_) | Self::Serialization { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}
