//! Telemetry configuration.

use crate::logging::LogConfig;
use crate::metrics::MetricsConfig;

/// Configuration for logging and metrics together.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, attached to the startup log event.
    pub service_name: String,

    /// Metrics configuration.
    pub metrics: MetricsConfig,

    /// Logging configuration.
    pub logging: LogConfig,
}

impl TelemetryConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::new()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "meridian".to_string(),
            metrics: MetricsConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

/// Builder for [`TelemetryConfig`].
#[derive(Debug, Default)]
pub struct TelemetryConfigBuilder {
    config: TelemetryConfig,
}

impl TelemetryConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service name.
    #[must_use]
    pub fn service_name(mut self, name: &str) -> Self {
        self.config.service_name = name.to_string();
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn logging(mut self, config: LogConfig) -> Self {
        self.config.logging = config;
        self
    }

    /// Sets the metrics configuration.
    #[must_use]
    pub fn metrics(mut self, config: MetricsConfig) -> Self {
        self.config.metrics = config;
        self
    }

    /// Enables metrics with a scrape listener on `addr`.
    #[must_use]
    pub fn metrics_addr(mut self, addr: &str) -> Self {
        self.config.metrics.enabled = true;
        self.config.metrics.addr = Some(addr.to_string());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TelemetryConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "meridian");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_builder() {
        let config = TelemetryConfig::builder()
            .service_name("edge")
            .logging(LogConfig::development())
            .metrics_addr("127.0.0.1:9100")
            .build();

        assert_eq!(config.service_name, "edge");
        assert!(!config.logging.json_format);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.addr.as_deref(), Some("127.0.0.1:9100"));
    }
}
