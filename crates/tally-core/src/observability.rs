//! Logging setup and span helpers.
//!
//! Every job run is wrapped in a span carrying the job name and a run ID, so
//! all events of one run can be correlated in the JSON output.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt};
use ulid::Ulid;

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!(
                "unknown log format '{other}' (expected json or pretty)"
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. Output goes to stderr so stdout stays free
/// for reports.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `tally_engine=debug`)
///
/// # Example
///
/// ```rust
/// use tally_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = match format {
            LogFormat::Json => registry
                .with(fmt_layer::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => registry
                .with(fmt_layer::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
        };
        if result.is_err() {
            // Someone else (usually a test harness) installed a subscriber first.
            tracing::debug!("global subscriber already set");
        }
    });
}

/// Creates the span wrapping one job run.
///
/// # Example
///
/// ```rust
/// use tally_core::observability::run_span;
/// use ulid::Ulid;
///
/// let span = run_span("aggregate", Ulid::new());
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn run_span(job: &'static str, run_id: Ulid) -> Span {
    tracing::info_span!("run", job = job, run_id = %run_id)
}
