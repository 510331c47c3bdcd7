//! Telemetry error types.

use thiserror::Error;

/// Errors raised while installing logging or metrics.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The metrics recorder or exporter could not be installed.
    #[error("failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// The log subscriber could not be installed.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    /// An address failed to parse.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TelemetryError::MetricsInit("recorder already set".to_string());
        assert_eq!(err.to_string(), "failed to initialize metrics: recorder already set");

        let err = TelemetryError::InvalidAddress("nope".to_string());
        assert_eq!(err.to_string(), "invalid address: nope");
    }
}
