//! Logging initialization.
//!
//! The dispatcher only emits `tracing` events; nothing is printed unless a
//! subscriber is installed. [`init_logging`] installs a formatted subscriber
//! filtered by `BRINY_LOG`, then `RUST_LOG`, then the given default level.
//! Calling it more than once is harmless.

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "warn";
const LOG_FILTER_ENV: &str = "BRINY_LOG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter `{0}`")]
    InvalidFilter(String),
    /// Another global subscriber was installed first.
    #[error("failed to install subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber once.
///
/// # Errors
///
/// Fails if the filter is malformed or another subscriber already owns the
/// global dispatcher.
pub fn init_logging(default_level: Option<&str>) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_try_init(|| {
            let directive = std::env::var(LOG_FILTER_ENV)
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| default_level.unwrap_or(DEFAULT_LOG_LEVEL).to_string());
            let filter = EnvFilter::try_new(&directive)
                .map_err(|_| LoggingError::InvalidFilter(directive.clone()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
                .map_err(|e| LoggingError::Install(e.to_string()))
        })
        .map(|_| ())
}
