//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber once at startup
//! - Pick text or JSON output from config
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - JSON format for production, text format for development

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("unknown log format {0:?}, expected \"text\" or \"json\"")]
    UnknownFormat(String),

    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Install the global subscriber.
pub fn init_logging(level: &str, format: &str) -> Result<(), LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidFilter {
            filter: level.to_string(),
            reason: e.to_string(),
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format.to_ascii_lowercase().as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
        "text" | "" => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        other => return Err(LoggingError::UnknownFormat(other.to_string())),
    };
    installed.map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))
}
