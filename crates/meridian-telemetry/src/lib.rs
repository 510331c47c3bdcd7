//! Logging and metrics for Meridian services.
//!
//! - **Logging**: a `tracing-subscriber` registry with a JSON or pretty
//!   `fmt` layer behind an `EnvFilter`
//! - **Metrics**: the `metrics` facade backed by a Prometheus recorder,
//!   optionally with its own scrape listener
//!
//! ```text
//!  meridian-server ─┐
//!  meridian-middleware ──►  tracing  ──► fmt layer (JSON | pretty) ──► stdout
//!  meridian-pbac ───┘        metrics  ──► Prometheus recorder ──► scrape listener
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use meridian_telemetry::{init_telemetry, LogConfig, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::builder()
//!         .service_name("edge")
//!         .logging(LogConfig::production())
//!         .metrics_addr("0.0.0.0:9090")
//!         .build();
//!     init_telemetry(&config).expect("telemetry");
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{TelemetryConfig, TelemetryConfigBuilder};
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, render_metrics, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs logging, then metrics.
///
/// # Errors
///
/// Returns the first subsystem failure.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}
