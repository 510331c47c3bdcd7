//! Layered configuration loading.

use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{ConfigError, LogFormat, MeridianConfig};

/// Builds a [`MeridianConfig`] from layers, later layers winning:
///
/// 1. defaults (or a preset)
/// 2. TOML or JSON files and strings
/// 3. `PREFIX__SECTION__KEY` environment variables
///
/// A file layer replaces the whole configuration; keys it omits take their
/// defaults.
///
/// ```no_run
/// use meridian_config::ConfigLoader;
///
/// # fn main() -> Result<(), meridian_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_defaults()
///     .with_file("meridian.toml")?
///     .with_env_prefix("MERIDIAN")
///     .with_dotenv()?
///     .load()?;
/// println!("listening on {}", config.server.http_addr);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    config: MeridianConfig,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// A loader holding the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets to the defaults.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = MeridianConfig::default();
        self
    }

    /// Resets to [`MeridianConfig::development`].
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = MeridianConfig::development();
        self
    }

    /// Resets to [`MeridianConfig::production`].
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = MeridianConfig::production();
        self
    }

    /// Loads a `.toml` or `.json` file, chosen by extension.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, unreadable, has another extension, or
    /// does not parse (unknown keys included).
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }
        self.config = parse_file(path)?;
        Ok(self)
    }

    /// Like [`with_file`](Self::with_file) but a missing file is skipped.
    ///
    /// # Errors
    ///
    /// Fails if an existing file cannot be read or parsed.
    pub fn with_optional_file(self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Parses `content` as `"toml"` or `"json"`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown format or a parse error.
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = parse_str(content, format)?;
        Ok(self)
    }

    /// Enables environment overrides such as `MERIDIAN__SERVER__HTTP_ADDR`.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Loads `.env` from the working directory (or a parent) into the
    /// process environment. A missing file is fine.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but is malformed.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "loaded .env");
                Ok(self)
            }
            Err(err) if err.not_found() => Ok(self),
            Err(err) => Err(err.into()),
        }
    }

    /// Applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable override or a validation failure.
    pub fn load(mut self) -> Result<MeridianConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }
        self.config.validate()?;
        Ok(self.config)
    }

    /// Applies environment overrides without validating.
    ///
    /// # Errors
    ///
    /// Fails on an unparsable override.
    pub fn load_unvalidated(mut self) -> Result<MeridianConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }
        Ok(self.config)
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let marker = format!("{prefix}__");
        let mut vars: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&marker))
            .collect();
        vars.sort();
        for (key, value) in vars {
            self.apply_env_var(&key, &value, prefix)?;
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(path) = key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix("__"))
        else {
            return Ok(());
        };
        let parts: Vec<&str> = path.split("__").collect();
        let c = &mut self.config;

        match parts.as_slice() {
            ["SERVER", "HTTP_ADDR"] => c.server.http_addr = value.to_string(),
            ["SERVER", "PROTOCOL"] => c.server.protocol = parse(key, value)?,
            ["SERVER", "HTTP2_ENABLED"] => c.server.http2_enabled = parse_flag(key, value)?,
            ["SERVER", "SHUTDOWN_TIMEOUT_SECS"] => {
                c.server.shutdown_timeout_secs = parse(key, value)?;
            }
            ["SERVER", "KEEP_ALIVE_SECS"] => c.server.keep_alive_secs = parse_opt(key, value)?,
            ["SERVER", "READ_TIMEOUT_MS"] => c.server.read_timeout_ms = parse_opt(key, value)?,
            ["SERVER", "MAX_HEADER_BYTES"] => c.server.max_header_bytes = parse(key, value)?,
            ["SERVER", "RESPONSE_BUFFER_BYTES"] => {
                c.server.response_buffer_bytes = parse(key, value)?;
            }
            ["SERVER", "SERVER_NAME"] => c.server.server_name = value.to_string(),
            ["SERVER", "MAX_CONNECTIONS"] => c.server.max_connections = parse_opt(key, value)?,

            ["TELEMETRY", "SERVICE_NAME"] => c.telemetry.service_name = value.to_string(),
            ["TELEMETRY", "LOGGING", "ENABLED"] => {
                c.telemetry.logging.enabled = parse_flag(key, value)?;
            }
            ["TELEMETRY", "LOGGING", "LEVEL"] => c.telemetry.logging.level = value.to_string(),
            ["TELEMETRY", "LOGGING", "FORMAT"] => {
                c.telemetry.logging.format = match value.to_ascii_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => return Err(ConfigError::env_parse_error(key, "expected 'json' or 'pretty'")),
                };
            }
            ["TELEMETRY", "LOGGING", "INCLUDE_LOCATION"] => {
                c.telemetry.logging.include_location = parse_flag(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ENABLED"] => {
                c.telemetry.metrics.enabled = parse_flag(key, value)?;
            }
            ["TELEMETRY", "METRICS", "ADDR"] => c.telemetry.metrics.addr = non_empty(value),

            ["MIDDLEWARE", "RATE", "SPEED"] => c.middleware.rate.speed = parse(key, value)?,
            ["MIDDLEWARE", "RATE", "MAX"] => c.middleware.rate.max = parse(key, value)?,
            ["MIDDLEWARE", "RATE", "IDLE_SECS"] => c.middleware.rate.idle_secs = parse(key, value)?,
            ["MIDDLEWARE", "RATE", "REAP_INTERVAL_SECS"] => {
                c.middleware.rate.reap_interval_secs = parse(key, value)?;
            }
            ["MIDDLEWARE", "BREAKER", "MAX_FAILURES"] => {
                c.middleware.breaker.max_failures = parse(key, value)?;
            }
            ["MIDDLEWARE", "BREAKER", "MAX_SUCCESSES"] => {
                c.middleware.breaker.max_successes = parse(key, value)?;
            }
            ["MIDDLEWARE", "BREAKER", "OPEN_WAIT_MS"] => {
                c.middleware.breaker.open_wait_ms = parse(key, value)?;
            }
            ["MIDDLEWARE", "BREAKER", "HALF_OPEN_INTERVAL_MS"] => {
                c.middleware.breaker.half_open_interval_ms = parse(key, value)?;
            }
            ["MIDDLEWARE", "CACHE", "TTL_SECS"] => c.middleware.cache.ttl_secs = parse(key, value)?,
            ["MIDDLEWARE", "CACHE", "MAX_BODY_BYTES"] => {
                c.middleware.cache.max_body_bytes = parse(key, value)?;
            }
            ["MIDDLEWARE", "CACHE", "PURGE_INTERVAL_SECS"] => {
                c.middleware.cache.purge_interval_secs = parse(key, value)?;
            }
            ["MIDDLEWARE", "COMPRESS", "BUDGET_BYTES"] => {
                c.middleware.compress.budget_bytes = parse(key, value)?;
            }
            ["MIDDLEWARE", "COMPRESS", "LEVEL"] => {
                c.middleware.compress.level = parse_opt(key, value)?;
            }
            ["MIDDLEWARE", "COMPRESS", "DENY_TYPES"] => {
                c.middleware.compress.deny_types = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            ["MIDDLEWARE", "TIMEOUT", "REQUEST_MS"] => {
                c.middleware.timeout.request_ms = parse_opt(key, value)?;
            }

            ["PBAC", "GUEST"] => c.pbac.guest = value.to_string(),
            ["PBAC", "POLICY_FILE"] => c.pbac.policy_file = non_empty(value).map(PathBuf::from),

            _ => tracing::debug!(var = key, "ignoring unknown configuration variable"),
        }

        Ok(())
    }
}

fn parse_file(path: &Path) -> Result<MeridianConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    parse_str(&content, format)
}

fn parse_str(content: &str, format: &str) -> Result<MeridianConfig, ConfigError> {
    match format.to_ascii_lowercase().as_str() {
        "toml" => Ok(toml::from_str(content)?),
        "json" => Ok(serde_json::from_str(content)?),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::env_parse_error(key, e.to_string()))
}

/// Empty or `none` clears an optional value.
fn parse_opt<T>(key: &str, value: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        parse(key, value).map(Some)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_parse_error(key, "expected boolean"))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use meridian_server::Protocol;

    use super::*;

    #[test]
    fn test_loader_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config, MeridianConfig::default());
    }

    #[test]
    fn test_presets() {
        let config = ConfigLoader::new().with_development().load().unwrap();
        assert_eq!(config.telemetry.logging.level, "debug");

        let config = ConfigLoader::new().with_production().load().unwrap();
        assert_eq!(config.telemetry.metrics.addr.as_deref(), Some("0.0.0.0:9090"));
    }

    #[test]
    fn test_with_string_toml() {
        let toml = r#"
            [server]
            http_addr = "127.0.0.1:9000"
            protocol = "fastcgi"
            max_connections = 64

            [middleware.rate]
            speed = 2.5
            max = 5

            [pbac]
            guest = "anonymous"
        "#;
        let config = ConfigLoader::new().with_string(toml, "toml").unwrap().load().unwrap();
        assert_eq!(config.server.http_addr, "127.0.0.1:9000");
        assert_eq!(config.server.protocol, Protocol::FastCgi);
        assert_eq!(config.server.max_connections, Some(64));
        assert!((config.middleware.rate.speed - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.middleware.rate.max, 5);
        assert_eq!(config.middleware.rate.idle_secs, 600);
        assert_eq!(config.pbac.guest, "anonymous");
    }

    #[test]
    fn test_with_string_json() {
        let json = r#"{"telemetry": {"service_name": "edge", "logging": {"format": "pretty"}}}"#;
        let config = ConfigLoader::new().with_string(json, "json").unwrap().load().unwrap();
        assert_eq!(config.telemetry.service_name, "edge");
        assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = ConfigLoader::new().with_string("[server]\nport = 80", "toml");
        assert!(matches!(result, Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn test_unsupported_format() {
        let result = ConfigLoader::new().with_string("server: {}", "yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(f)) if f == "yaml"));
    }

    #[test]
    fn test_load_validates() {
        let result = ConfigLoader::new()
            .with_string("[server]\nresponse_buffer_bytes = 0", "toml")
            .unwrap()
            .load();
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let config = ConfigLoader::new()
            .with_string("[server]\nresponse_buffer_bytes = 0", "toml")
            .unwrap()
            .load_unvalidated()
            .unwrap();
        assert_eq!(config.server.response_buffer_bytes, 0);
    }

    #[test]
    fn test_with_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[middleware.cache]\nttl_secs = 5").unwrap();

        let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(config.middleware.cache.ttl_secs, 5);
    }

    #[test]
    fn test_with_file_not_found() {
        let result = ConfigLoader::new().with_file("/nonexistent/meridian.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));

        let config = ConfigLoader::new()
            .with_optional_file("/nonexistent/meridian.toml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_file_extension_selects_format() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"pbac": {{"policy_file": "/etc/meridian/policies.json"}}}}"#).unwrap();

        let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(
            config.pbac.policy_file.as_deref(),
            Some(Path::new("/etc/meridian/policies.json"))
        );
    }

    #[test]
    fn test_parse_bool() {
        for yes in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(yes), Some(true), "{yes}");
        }
        for no in ["false", "0", "no", "off"] {
            assert_eq!(parse_bool(no), Some(false), "{no}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_apply_env_var_server() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("T__SERVER__HTTP_ADDR", "10.0.0.1:80", "T").unwrap();
        loader.apply_env_var("T__SERVER__PROTOCOL", "fastcgi", "T").unwrap();
        loader.apply_env_var("T__SERVER__HTTP2_ENABLED", "yes", "T").unwrap();
        loader.apply_env_var("T__SERVER__KEEP_ALIVE_SECS", "none", "T").unwrap();
        assert_eq!(loader.config.server.http_addr, "10.0.0.1:80");
        assert_eq!(loader.config.server.protocol, Protocol::FastCgi);
        assert!(loader.config.server.http2_enabled);
        assert!(loader.config.server.keep_alive_secs.is_none());
    }

    #[test]
    fn test_apply_env_var_nested_sections() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("T__TELEMETRY__LOGGING__FORMAT", "pretty", "T").unwrap();
        loader.apply_env_var("T__MIDDLEWARE__RATE__SPEED", "0.25", "T").unwrap();
        loader
            .apply_env_var("T__MIDDLEWARE__COMPRESS__DENY_TYPES", "text/csv, application/x-tar", "T")
            .unwrap();
        loader.apply_env_var("T__PBAC__GUEST", "visitor", "T").unwrap();

        let config = loader.config;
        assert_eq!(config.telemetry.logging.format, LogFormat::Pretty);
        assert!((config.middleware.rate.speed - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.middleware.compress.deny_types, vec!["text/csv", "application/x-tar"]);
        assert_eq!(config.pbac.guest, "visitor");
    }

    #[test]
    fn test_apply_env_var_invalid() {
        let mut loader = ConfigLoader::new();
        let err = loader
            .apply_env_var("T__SERVER__MAX_HEADER_BYTES", "lots", "T")
            .unwrap_err();
        assert!(err.to_string().contains("T__SERVER__MAX_HEADER_BYTES"));

        assert!(loader.apply_env_var("T__SERVER__PROTOCOL", "gopher", "T").is_err());
        assert!(loader.apply_env_var("T__TELEMETRY__LOGGING__FORMAT", "xml", "T").is_err());
    }

    #[test]
    fn test_unknown_env_var_ignored() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("T__SERVER__COLOR", "blue", "T").unwrap();
        loader.apply_env_var("OTHER__SERVER__HTTP_ADDR", "1.2.3.4:5", "T").unwrap();
        assert_eq!(loader.config, MeridianConfig::default());
    }

    #[test]
    fn test_env_overrides_file_layer() {
        // Prefix unique to this test so parallel tests never see it.
        env::set_var("MERIDIAN_LOADER_TEST__SERVER__SERVER_NAME", "edge-7");
        let config = ConfigLoader::new()
            .with_string("[server]\nserver_name = \"from-file\"", "toml")
            .unwrap()
            .with_env_prefix("MERIDIAN_LOADER_TEST")
            .load()
            .unwrap();
        env::remove_var("MERIDIAN_LOADER_TEST__SERVER__SERVER_NAME");
        assert_eq!(config.server.server_name, "edge-7");
    }
}
