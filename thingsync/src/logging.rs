//! Logging setup for applications using thingsync
//!
//! The SDK only emits `tracing` events; nothing is printed until the
//! application installs a subscriber. These helpers install one with sensible
//! defaults for the common cases.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// How log output is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr lines at `info`
    Development,
    /// Pretty multi-line output at `debug`, with threads and source locations
    Debug,
    /// One JSON object per event, for log shippers on gateways
    Json,
}

impl LoggingMode {
    /// Parse a `THINGSYNC_LOG_MODE` value; unknown values are `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Some(LoggingMode::Silent),
            "development" | "dev" => Some(LoggingMode::Development),
            "debug" => Some(LoggingMode::Debug),
            "json" => Some(LoggingMode::Json),
            _ => None,
        }
    }

    fn default_level(self) -> &'static str {
        match self {
            LoggingMode::Debug => "debug",
            _ => "info",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },
}

/// Install a global subscriber for `mode`.
///
/// Fails if another subscriber was already installed.
///
/// # Environment Variables
///
/// - `THINGSYNC_LOG_LEVEL`: filter directive, e.g. `thingsync_client=trace`
/// - `RUST_LOG`: used when `THINGSYNC_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let result = match mode {
        LoggingMode::Silent => return Ok(()),
        LoggingMode::Development => Registry::default()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .compact(),
            )
            .with(create_env_filter(mode.default_level())?)
            .try_init(),
        LoggingMode::Debug => Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(create_env_filter(mode.default_level())?)
            .try_init(),
        LoggingMode::Json => Registry::default()
            .with(fmt::layer().json().with_current_span(false))
            .with(create_env_filter(mode.default_level())?)
            .try_init(),
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

/// Install a subscriber chosen by `THINGSYNC_LOG_MODE`.
///
/// Missing or unrecognized values fall back to [`LoggingMode::Silent`].
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging(mode_from_env())
}

pub fn mode_from_env() -> LoggingMode {
    std::env::var("THINGSYNC_LOG_MODE")
        .ok()
        .and_then(|value| LoggingMode::parse(&value))
        .unwrap_or(LoggingMode::Silent)
}

/// `THINGSYNC_LOG_LEVEL`, then `RUST_LOG`, then `default_level`
pub fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var("THINGSYNC_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
        filter: directives,
        reason: e.to_string(),
    })
}

/// A global subscriber has been installed
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
