//! Typed, layered configuration for Meridian.
//!
//! [`MeridianConfig`] is assembled by [`ConfigLoader`] from defaults, TOML or
//! JSON files, and `PREFIX__SECTION__KEY` environment variables. Every section
//! rejects unknown keys.
//!
//! # Example
//!
//! ```no_run
//! use meridian_config::ConfigLoader;
//!
//! # fn main() -> Result<(), meridian_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_optional_file("meridian.toml")?
//!     .with_env_prefix("MERIDIAN")
//!     .load()?;
//! println!("protocol: {}", config.server.protocol);
//! # Ok(())
//! # }
//! ```
//!
//! # File format
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:8080"
//! protocol = "http"            # or "fastcgi"
//! http2_enabled = true
//! response_buffer_bytes = 2048
//!
//! [telemetry]
//! service_name = "edge"
//!
//! [telemetry.logging]
//! level = "info"
//! format = "json"
//!
//! [telemetry.metrics]
//! addr = "0.0.0.0:9090"
//!
//! [middleware.rate]
//! speed = 10.0
//! max = 20
//!
//! [middleware.breaker]
//! max_failures = 5
//! open_wait_ms = 10000
//!
//! [pbac]
//! guest = "guest"
//! policy_file = "/etc/meridian/policies.json"
//! ```
//!
//! # Environment overrides
//!
//! - `MERIDIAN__SERVER__HTTP_ADDR=0.0.0.0:9000`
//! - `MERIDIAN__TELEMETRY__LOGGING__LEVEL=debug`
//! - `MERIDIAN__MIDDLEWARE__RATE__SPEED=2.5`
//! - `MERIDIAN__SERVER__KEEP_ALIVE_SECS=none` clears an optional value

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::MeridianConfig;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
