//! Structured logging.
//!
//! Installs a `tracing-subscriber` registry with one `fmt` layer, JSON for
//! production and pretty for development, filtered by an [`EnvFilter`]
//! directive such as `info` or `meridian_server=debug,info`.
//!
//! ```rust,no_run
//! use meridian_telemetry::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::development()).expect("logging");
//! tracing::info!(route = "/users/:id", "route registered");
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether logging is installed at all.
    pub enabled: bool,

    /// `EnvFilter` directive (e.g. `info`, `meridian_pbac=debug,warn`).
    pub level: String,

    /// JSON lines instead of the pretty format.
    pub json_format: bool,

    /// Emit span open/close events.
    pub span_events: bool,

    /// Include file and line of the call site.
    pub file_line_info: bool,

    /// Include the module path.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl LogConfig {
    /// Human-readable output at `debug`.
    #[must_use]
    pub fn development() -> Self {
        Self {
            enabled: true,
            level: "debug".to_string(),
            json_format: false,
            span_events: true,
            file_line_info: true,
            include_target: true,
        }
    }

    /// JSON output at `info`.
    #[must_use]
    pub fn production() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json_format: true,
            span_events: false,
            file_line_info: false,
            include_target: true,
        }
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::LoggingInit`] for an invalid filter directive or
/// when a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = create_env_filter(&config.level)?;
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = if config.json_format {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.file_line_info)
            .with_line_number(config.file_line_info)
            .with_target(config.include_target)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.file_line_info)
            .with_line_number(config.file_line_info)
            .with_target(config.include_target)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Parses an `EnvFilter` directive.
///
/// # Errors
///
/// Returns [`TelemetryError::LoggingInit`] if the directive is invalid.
pub fn create_env_filter(directive: &str) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| TelemetryError::LoggingInit(format!("invalid log level '{directive}': {e}")))
}

/// Field names shared by every crate's log events.
pub mod fields {
    /// Request id.
    pub const REQUEST_ID: &str = "request_id";

    /// Request method.
    pub const HTTP_METHOD: &str = "http.method";

    /// Request path.
    pub const HTTP_PATH: &str = "http.path";

    /// Response status.
    pub const HTTP_STATUS: &str = "http.status";

    /// Matched route pattern.
    pub const ROUTE: &str = "route";

    /// Error description.
    pub const ERROR: &str = "error";
}
