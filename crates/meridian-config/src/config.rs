//! The root configuration type.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, LogFormat, MiddlewareConfig, PbacConfig, ServerConfig, TelemetrySection};

/// Complete Meridian configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to layer files and environment
/// variables over the defaults.
///
/// ```
/// use meridian_config::MeridianConfig;
///
/// let config = MeridianConfig::default();
/// assert_eq!(config.pbac.guest, "guest");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MeridianConfig {
    /// Listener and transport.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub telemetry: TelemetrySection,

    /// Middleware parameters.
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Policy runtime.
    #[serde(default)]
    pub pbac: PbacConfig,
}

impl MeridianConfig {
    /// Checks values serde cannot: addresses, sizes and rates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_addr("server.http_addr", &self.server.http_addr)?;
        if let Some(addr) = &self.telemetry.metrics.addr {
            check_addr("telemetry.metrics.addr", addr)?;
        }

        if self.server.max_header_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_header_bytes",
                "must be greater than zero",
            ));
        }
        if self.server.response_buffer_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "server.response_buffer_bytes",
                "must be greater than zero",
            ));
        }
        if self.server.max_connections == Some(0) {
            return Err(ConfigError::invalid_value(
                "server.max_connections",
                "must be greater than zero when set",
            ));
        }

        let rate = &self.middleware.rate;
        if !(rate.speed.is_finite() && rate.speed > 0.0) {
            return Err(ConfigError::invalid_value(
                "middleware.rate.speed",
                format!("must be a positive number, got {}", rate.speed),
            ));
        }
        if rate.max == 0 {
            return Err(ConfigError::invalid_value(
                "middleware.rate.max",
                "must be greater than zero",
            ));
        }
        if rate.reap_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "middleware.rate.reap_interval_secs",
                "must be greater than zero",
            ));
        }

        if self.middleware.cache.purge_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "middleware.cache.purge_interval_secs",
                "must be greater than zero",
            ));
        }

        let breaker = &self.middleware.breaker;
        if breaker.max_failures == 0 || breaker.max_successes == 0 {
            return Err(ConfigError::invalid_value(
                "middleware.breaker",
                "max_failures and max_successes must be greater than zero",
            ));
        }

        if self.middleware.compress.level.is_some_and(|level| level > 11) {
            return Err(ConfigError::invalid_value(
                "middleware.compress.level",
                "must be between 0 and 11",
            ));
        }
        if self.middleware.timeout.request_ms == Some(0) {
            return Err(ConfigError::invalid_value(
                "middleware.timeout.request_ms",
                "must be greater than zero when set",
            ));
        }

        if self.pbac.guest.is_empty() {
            return Err(ConfigError::invalid_value("pbac.guest", "must not be empty"));
        }

        Ok(())
    }

    /// Pretty debug logs with call sites.
    ///
    /// ```
    /// use meridian_config::{LogFormat, MeridianConfig};
    ///
    /// let config = MeridianConfig::development();
    /// assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.server.http_addr = "127.0.0.1:8080".to_string();
        config.telemetry.logging.level = "debug".to_string();
        config.telemetry.logging.format = LogFormat::Pretty;
        config.telemetry.logging.include_location = true;
        config
    }

    /// JSON logs at `info` with a scrape listener on `0.0.0.0:9090`.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.telemetry.logging.level = "info".to_string();
        config.telemetry.logging.format = LogFormat::Json;
        config.telemetry.metrics.addr = Some("0.0.0.0:9090".to_string());
        config
    }
}

fn check_addr(field: &str, addr: &str) -> Result<(), ConfigError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ConfigError::invalid_value(field, format!("invalid socket address: {addr}")))
}
