//! Prometheus metrics.
//!
//! Every crate records through the `metrics` facade; this module installs
//! the Prometheus recorder behind it, optionally with its own HTTP scrape
//! listener.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `meridian_requests_total` | Counter | `route`, `status` |
//! | `meridian_request_duration_seconds` | Histogram | `route` |
//! | `meridian_in_flight_requests` | Gauge | |
//! | `meridian_breaker_transitions_total` | Counter | `route`, `state` |
//! | `meridian_rate_limited_total` | Counter | |
//! | `meridian_cache_hits_total` | Counter | |
//! | `meridian_cache_misses_total` | Counter | |
//! | `meridian_pbac_decisions_total` | Counter | `effect` |

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::error::TelemetryError;
use crate::TelemetryResult;

/// Requests served, by route pattern and status.
pub const REQUESTS_TOTAL: &str = "meridian_requests_total";
/// Request latency.
pub const REQUEST_DURATION: &str = "meridian_request_duration_seconds";
/// Requests currently inside the pipeline.
pub const IN_FLIGHT: &str = "meridian_in_flight_requests";
/// Breaker state changes.
pub const BREAKER_TRANSITIONS: &str = "meridian_breaker_transitions_total";
/// Requests rejected by the rate limiter.
pub const RATE_LIMITED: &str = "meridian_rate_limited_total";
/// Responses served from the cache.
pub const CACHE_HITS: &str = "meridian_cache_hits_total";
/// Responses computed because the cache had no entry.
pub const CACHE_MISSES: &str = "meridian_cache_misses_total";
/// PBAC decisions by effect.
pub const PBAC_DECISIONS: &str = "meridian_pbac_decisions_total";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether the recorder is installed.
    pub enabled: bool,

    /// Scrape listener address; `None` keeps metrics in-process only,
    /// readable through [`render_metrics`].
    pub addr: Option<String>,

    /// Bucket bounds for the request duration histogram.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: None,
            // 1ms .. 10s
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Installs the global Prometheus recorder.
///
/// With an `addr` the scrape listener runs on the current Tokio runtime.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidAddress`] for a bad listener address and
/// [`TelemetryError::MetricsInit`] when a recorder is already installed, the
/// buckets are invalid, or no runtime is available for the listener.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION.to_string()),
            &config.duration_buckets,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let handle = match &config.addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;
            let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                TelemetryError::MetricsInit("the scrape listener needs a Tokio runtime".to_string())
            })?;
            let (recorder, exporter) = builder
                .with_http_listener(addr)
                .build()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            runtime.spawn(async move {
                if let Err(err) = exporter.await {
                    tracing::error!(error = ?err, "metrics listener stopped");
                }
            });
            tracing::info!(%addr, "metrics listener started");
            handle
        }
        None => builder
            .install_recorder()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?,
    };

    let _ = HANDLE.set(handle);
    describe();
    Ok(())
}

/// Renders current metrics in the Prometheus text format, if a recorder was
/// installed by [`init_metrics`].
#[must_use]
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

fn describe() {
    describe_counter!(REQUESTS_TOTAL, "Requests served by route and status");
    describe_histogram!(REQUEST_DURATION, Unit::Seconds, "Request latency");
    describe_gauge!(IN_FLIGHT, "Requests currently being processed");
    describe_counter!(BREAKER_TRANSITIONS, "Circuit breaker state transitions");
    describe_counter!(RATE_LIMITED, "Requests rejected by the rate limiter");
    describe_counter!(CACHE_HITS, "Responses served from the response cache");
    describe_counter!(CACHE_MISSES, "Cache lookups that ran the handler");
    describe_counter!(PBAC_DECISIONS, "Policy decisions by effect");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.addr.is_none());
        assert_eq!(config.duration_buckets.len(), 12);
    }

    #[test]
    fn test_invalid_addr() {
        let config = MetricsConfig {
            addr: Some("not-an-addr".to_string()),
            ..MetricsConfig::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_disabled_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_render_after_install() {
        init_metrics(&MetricsConfig::default()).unwrap();
        metrics::counter!(REQUESTS_TOTAL, "route" => "/users/:id", "status" => "200").increment(3);

        let rendered = render_metrics().unwrap();
        assert!(rendered.contains("meridian_requests_total"), "{rendered}");
        assert!(rendered.contains("route=\"/users/:id\""), "{rendered}");

        // A second recorder cannot be installed.
        assert!(matches!(
            init_metrics(&MetricsConfig::default()),
            Err(TelemetryError::MetricsInit(_))
        ));
    }
}
