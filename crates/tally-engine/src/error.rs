//! Error types for tally jobs.

use thiserror::Error;

/// Result type alias for job operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that abort a job run.
///
/// Data errors on individual records never surface here; they are logged and
/// counted in the run report instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A store operation failed.
    #[error(transparent)]
    Core(#[from] tally_core::Error),

    /// The engine configuration is unusable.
    #[error("invalid configuration: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A blob copy from primary to backup failed.
    #[error("backup copy of '{path}' failed: {source}")]
    BackupCopy {
        /// Object path that failed to copy.
        path: String,
        /// The underlying store error.
        #[source]
        source: tally_core::Error,
    },
}

impl EngineError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
