//! Configuration sections.
//!
//! Every section rejects unknown keys and fills missing ones from its
//! `default_*` function, so a file only needs the values it changes.

use std::path::PathBuf;

use meridian_server::Protocol;
use serde::{Deserialize, Serialize};

/// `[server]`: listener and transport settings.
///
/// ```
/// use meridian_config::ServerConfig;
///
/// let config = ServerConfig {
///     http_addr: "127.0.0.1:9000".to_string(),
///     ..ServerConfig::default()
/// };
/// assert_eq!(config.response_buffer_bytes, 2048);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Wire protocol: `http` or `fastcgi`.
    #[serde(default)]
    pub protocol: Protocol,

    /// Serve HTTP/2 prior-knowledge connections on the HTTP listener.
    #[serde(default)]
    pub http2_enabled: bool,

    /// Time allowed for in-flight connections after shutdown starts.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Idle keep-alive timeout. `None` waits indefinitely.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: Option<u64>,

    /// Deadline for reading a request head.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Largest accepted request head (or FastCGI params block).
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Response bytes buffered before the head is committed.
    #[serde(default = "default_response_buffer")]
    pub response_buffer_bytes: usize,

    /// Value of the injected `Server` header.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Concurrent connection limit. `None` is unlimited.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            protocol: Protocol::default(),
            http2_enabled: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
            keep_alive_secs: default_keep_alive(),
            read_timeout_ms: None,
            max_header_bytes: default_max_header_bytes(),
            response_buffer_bytes: default_response_buffer(),
            server_name: default_server_name(),
            max_connections: None,
        }
    }
}

fn default_http_addr() -> String {
    meridian_server::DEFAULT_HTTP_ADDR.to_string()
}

fn default_shutdown_timeout() -> u64 {
    meridian_server::DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

#[allow(clippy::unnecessary_wraps)]
fn default_keep_alive() -> Option<u64> {
    Some(meridian_server::DEFAULT_KEEP_ALIVE_SECS)
}

fn default_max_header_bytes() -> usize {
    meridian_server::DEFAULT_MAX_HEADER_BYTES
}

fn default_response_buffer() -> usize {
    meridian_server::DEFAULT_RESPONSE_BUFFER
}

fn default_server_name() -> String {
    meridian_server::DEFAULT_SERVER_NAME.to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

/// `[telemetry.logging]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Install a subscriber at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include file and line of each event.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[telemetry.metrics]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scrape listener address. Without one, metrics stay in-process.
    #[serde(default)]
    pub addr: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: None,
        }
    }
}

/// `[telemetry]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Service name attached to logs.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "meridian".to_string()
}

/// `[middleware.rate]`: token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    /// Tokens refilled per second.
    #[serde(default = "default_rate_speed")]
    pub speed: f64,

    /// Bucket capacity (burst).
    #[serde(default = "default_rate_max")]
    pub max: u32,

    /// Buckets idle this long are reaped.
    #[serde(default = "default_rate_idle")]
    pub idle_secs: u64,

    /// How often the reaper runs.
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            speed: default_rate_speed(),
            max: default_rate_max(),
            idle_secs: default_rate_idle(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_rate_speed() -> f64 {
    10.0
}

fn default_rate_max() -> u32 {
    20
}

fn default_rate_idle() -> u64 {
    600
}

fn default_reap_interval() -> u64 {
    60
}

/// `[middleware.breaker]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    #[serde(default = "default_max_failures")]
    pub max_failures: u64,

    /// Consecutive half-open successes that close it again.
    #[serde(default = "default_max_successes")]
    pub max_successes: u64,

    /// Time spent open before probing.
    #[serde(default = "default_open_wait")]
    pub open_wait_ms: u64,

    /// Minimum gap between admitted half-open probes.
    #[serde(default = "default_half_open_interval")]
    pub half_open_interval_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            max_successes: default_max_successes(),
            open_wait_ms: default_open_wait(),
            half_open_interval_ms: default_half_open_interval(),
        }
    }
}

fn default_max_failures() -> u64 {
    5
}

fn default_max_successes() -> u64 {
    2
}

fn default_open_wait() -> u64 {
    10_000
}

fn default_half_open_interval() -> u64 {
    1_000
}

/// `[middleware.cache]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Entry lifetime.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Responses larger than this are served but not stored.
    #[serde(default = "default_cache_body")]
    pub max_body_bytes: usize,

    /// How often expired entries are purged.
    #[serde(default = "default_cache_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_body_bytes: default_cache_body(),
            purge_interval_secs: default_cache_purge_interval(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_body() -> usize {
    1024 * 1024
}

fn default_cache_purge_interval() -> u64 {
    30
}

/// `[middleware.compress]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompressConfig {
    /// Bytes buffered before the compression decision.
    #[serde(default = "default_compress_budget")]
    pub budget_bytes: usize,

    /// Explicit encoder level (0-11). `None` uses each encoder's default.
    #[serde(default)]
    pub level: Option<u32>,

    /// Extra content types never compressed, on top of the built-in list.
    #[serde(default)]
    pub deny_types: Vec<String>,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            budget_bytes: default_compress_budget(),
            level: None,
            deny_types: Vec::new(),
        }
    }
}

fn default_compress_budget() -> usize {
    4096
}

/// `[middleware.timeout]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Per-request deadline. `None` disables the timeout stage.
    #[serde(default = "default_request_timeout")]
    pub request_ms: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_request_timeout() -> Option<u64> {
    Some(30_000)
}

/// `[middleware]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct MiddlewareConfig {
    /// Rate limiting.
    #[serde(default)]
    pub rate: RateConfig,

    /// Circuit breaking.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Response caching.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Response compression.
    #[serde(default)]
    pub compress: CompressConfig,

    /// Request deadline.
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

/// `[pbac]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PbacConfig {
    /// User whose policies apply to unauthenticated requests.
    #[serde(default = "default_guest")]
    pub guest: String,

    /// JSON policy document loaded at startup.
    #[serde(default)]
    pub policy_file: Option<PathBuf>,
}

impl Default for PbacConfig {
    fn default() -> Self {
        Self {
            guest: default_guest(),
            policy_file: None,
        }
    }
}

fn default_guest() -> String {
    "guest".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.keep_alive_secs, Some(75));
        assert_eq!(config.response_buffer_bytes, 2048);
        assert!(config.max_connections.is_none());
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config: ServerConfig = toml::from_str(r#"protocol = "fastcgi""#).unwrap();
        assert_eq!(config.protocol, Protocol::FastCgi);
        assert_eq!(config.server_name, "meridian");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<RateConfig, _> = toml::from_str("speed = 5.0\nburst = 3");
        assert!(result.unwrap_err().to_string().contains("burst"));
    }

    #[test]
    fn test_log_format_names() {
        let config: LoggingConfig = toml::from_str(r#"format = "pretty""#).unwrap();
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.enabled);
    }

    #[test]
    fn test_timeout_can_be_disabled_in_json() {
        let config: TimeoutConfig = serde_json::from_str(r#"{"request_ms": null}"#).unwrap();
        assert!(config.request_ms.is_none());
    }
}
