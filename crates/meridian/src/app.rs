//! Assembling a server from [`MeridianConfig`].

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use meridian_config::{ConfigLoader, LogFormat, MeridianConfig};
use meridian_core::Chain;
use meridian_middleware::stages::{
    AccessLog, BreakerMiddleware, CacheMiddleware, CompressionLevel, CompressionMiddleware,
    IpFilter, RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware, TimeoutMiddleware,
};
use meridian_middleware::{one_per_interval, BreakerConfig, BreakerStore, CacheStore};
use meridian_pbac::{PbacMiddleware, PolicyStore};
use meridian_server::{Routes, Server, ServerConfig, ShutdownSignal};
use meridian_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admin::{self, Admin};

/// Environment prefix read by [`load_config`].
pub const ENV_PREFIX: &str = "MERIDIAN";

/// Configuration file read by [`load_config`] when present.
pub const CONFIG_FILE: &str = "meridian.toml";

/// Loads configuration from defaults, `meridian.toml` if it exists, a
/// `.env` file and `MERIDIAN__*` variables.
///
/// # Errors
///
/// Fails on unreadable or invalid configuration.
pub fn load_config() -> anyhow::Result<MeridianConfig> {
    load_config_from(CONFIG_FILE)
}

/// Like [`load_config`] with an explicit file path.
///
/// # Errors
///
/// Fails on unreadable or invalid configuration.
pub fn load_config_from(path: impl AsRef<Path>) -> anyhow::Result<MeridianConfig> {
    let path = path.as_ref();
    ConfigLoader::new()
        .with_defaults()
        .with_optional_file(path)
        .with_context(|| format!("reading {}", path.display()))?
        .with_dotenv()
        .context("reading .env")?
        .with_env_prefix(ENV_PREFIX)
        .load()
        .context("invalid configuration")
}

/// Installs logging and metrics, then assembles the [`App`].
///
/// # Errors
///
/// Fails if telemetry cannot be installed or the policy file cannot be
/// loaded.
pub async fn bootstrap(config: MeridianConfig) -> anyhow::Result<App> {
    meridian_telemetry::init_telemetry(&telemetry_config(&config))
        .context("installing telemetry")?;
    App::from_config(config).await
}

/// The transport settings of `config`.
#[must_use]
pub fn server_config(config: &MeridianConfig) -> ServerConfig {
    let server = &config.server;
    ServerConfig::builder()
        .http_addr(server.http_addr.clone())
        .protocol(server.protocol)
        .http2_enabled(server.http2_enabled)
        .shutdown_timeout(Duration::from_secs(server.shutdown_timeout_secs))
        .keep_alive_timeout(server.keep_alive_secs.map(Duration::from_secs))
        .read_timeout(server.read_timeout_ms.map(Duration::from_millis))
        .max_header_bytes(server.max_header_bytes)
        .response_buffer(server.response_buffer_bytes)
        .server_name(server.server_name.clone())
        .max_connections(server.max_connections)
        .build()
}

/// The logging and metrics settings of `config`.
#[must_use]
pub fn telemetry_config(config: &MeridianConfig) -> TelemetryConfig {
    let section = &config.telemetry;
    let logging = LogConfig {
        enabled: section.logging.enabled,
        level: section.logging.level.clone(),
        json_format: section.logging.format == LogFormat::Json,
        span_events: false,
        file_line_info: section.logging.include_location,
        include_target: true,
    };
    let metrics = MetricsConfig {
        enabled: section.metrics.enabled,
        addr: section.metrics.addr.clone(),
        ..MetricsConfig::default()
    };
    TelemetryConfig::builder()
        .service_name(&section.service_name)
        .logging(logging)
        .metrics(metrics)
        .build()
}

/// Middleware built from configuration, shared between routes and the
/// admin API.
///
/// The global stack (recovery, request id, access log, IP filter and the
/// request deadline) is installed on the route table by
/// [`App::from_config`]. The rest are handed out for per-route chains:
///
/// ```ignore
/// let rate = app.components().rate_limit.clone();
/// app.routes_mut().get("/search", Chain::from(rate).with(search))?;
/// ```
#[derive(Debug, Clone)]
pub struct Components {
    /// Breakers keyed by route pattern.
    pub breakers: BreakerStore,
    /// Token-bucket limiter keyed by client IP.
    pub rate_limit: RateLimitMiddleware,
    /// Single-flight response cache.
    pub cache: CacheMiddleware,
    /// Response compression.
    pub compression: CompressionMiddleware,
    /// IP black/allow lists.
    pub ip_filter: IpFilter,
    /// Policies and members.
    pub policies: PolicyStore,
    /// Request deadline, if enabled.
    pub timeout: Option<TimeoutMiddleware>,
}

impl Components {
    /// Builds every component. Loading the policy file is left to
    /// [`App::from_config`].
    #[must_use]
    pub fn from_config(config: &MeridianConfig) -> Self {
        let mw = &config.middleware;

        let breakers = BreakerStore::new(BreakerConfig {
            max_failures: mw.breaker.max_failures,
            max_successes: mw.breaker.max_successes,
            open_wait: Duration::from_millis(mw.breaker.open_wait_ms),
            half_open: one_per_interval(Duration::from_millis(mw.breaker.half_open_interval_ms)),
        });

        let rate_limit = RateLimitMiddleware::builder()
            .speed(mw.rate.speed)
            .burst(mw.rate.max)
            .build();

        let cache = CacheMiddleware::new(CacheStore::new(Duration::from_secs(mw.cache.ttl_secs)))
            .max_body_bytes(mw.cache.max_body_bytes);

        let level = mw
            .compress
            .level
            .map_or(CompressionLevel::Default, CompressionLevel::Custom);
        let mut compression = CompressionMiddleware::builder()
            .budget(mw.compress.budget_bytes)
            .level(level);
        for content_type in &mw.compress.deny_types {
            compression = compression.deny_type(content_type.clone());
        }

        Self {
            breakers,
            rate_limit,
            cache,
            compression: compression.build(),
            ip_filter: IpFilter::new(),
            policies: PolicyStore::with_guest(config.pbac.guest.clone()),
            timeout: mw.timeout.request_ms.map(|ms| TimeoutMiddleware::new(Duration::from_millis(ms))),
        }
    }

    /// A breaker stage sharing the store with the admin API.
    #[must_use]
    pub fn breaker(&self) -> BreakerMiddleware {
        BreakerMiddleware::new(self.breakers.clone())
    }

    /// A PBAC stage over the shared store.
    #[must_use]
    pub fn pbac(&self) -> PbacMiddleware {
        PbacMiddleware::new(self.policies.clone())
    }

    /// The state the admin API operates on.
    #[must_use]
    pub fn admin(&self) -> Admin {
        Admin {
            breakers: self.breakers.clone(),
            ip_filter: self.ip_filter.clone(),
            policies: self.policies.clone(),
        }
    }
}

/// A configured server that has not started yet.
#[derive(Debug)]
pub struct App {
    config: MeridianConfig,
    components: Components,
    routes: Routes,
}

impl App {
    /// Builds the components, loads the policy file and installs the
    /// global middleware.
    ///
    /// # Errors
    ///
    /// Fails if the configured policy file cannot be read or is invalid.
    pub async fn from_config(config: MeridianConfig) -> anyhow::Result<Self> {
        let components = Components::from_config(&config);

        if let Some(path) = &config.pbac.policy_file {
            components
                .policies
                .load_file(path)
                .await
                .with_context(|| format!("loading policy file {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                policies = components.policies.policies().len(),
                members = components.policies.members().len(),
                "policy document loaded"
            );
        }

        let mut routes = Routes::new();
        routes
            .use_middleware(RecoveryMiddleware::new())
            .use_middleware(RequestIdMiddleware::new())
            .use_middleware(AccessLog::new(config.telemetry.service_name.clone()))
            .use_middleware(components.ip_filter.clone());
        if let Some(timeout) = components.timeout {
            routes.use_middleware(timeout);
        }

        Ok(Self {
            config,
            components,
            routes,
        })
    }

    /// The configuration this app was built from.
    #[must_use]
    pub fn config(&self) -> &MeridianConfig {
        &self.config
    }

    /// Shared middleware and stores.
    #[must_use]
    pub fn components(&self) -> &Components {
        &self.components
    }

    /// The route table, for registering application routes.
    pub fn routes_mut(&mut self) -> &mut Routes {
        &mut self.routes
    }

    /// Registers `chain` for `GET pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed patterns.
    pub fn get(&mut self, pattern: &str, chain: impl Into<Chain>) -> anyhow::Result<&mut Self> {
        self.routes.get(pattern, chain)?;
        Ok(self)
    }

    /// Mounts the admin API under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if `prefix` produces invalid patterns.
    pub fn mount_admin(&mut self, prefix: &str) -> anyhow::Result<&mut Self> {
        admin::mount(&mut self.routes, prefix, self.components.admin())
            .with_context(|| format!("mounting admin API at '{prefix}'"))?;
        Ok(self)
    }

    /// Consumes the app, returning the route table.
    #[must_use]
    pub fn into_routes(self) -> Routes {
        self.routes
    }

    /// Serves until SIGTERM or SIGINT.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with_shutdown(ShutdownSignal::with_os_signals()).await
    }

    /// Serves until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let reapers = self.spawn_reapers(&shutdown);
        let server = Server::new(server_config(&self.config), self.routes);
        let result = server.run_with_shutdown(shutdown).await;
        reapers.iter().for_each(JoinHandle::abort);
        result.context("server failed")
    }

    /// Serves connections from an already bound listener.
    ///
    /// # Errors
    ///
    /// Fails if the listener breaks.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let reapers = self.spawn_reapers(&shutdown);
        let server = Server::new(server_config(&self.config), self.routes);
        let result = server.serve(listener, shutdown).await;
        reapers.iter().for_each(JoinHandle::abort);
        result.context("server failed")
    }

    /// Starts the tasks dropping idle rate buckets and expired cache
    /// entries.
    fn spawn_reapers(&self, shutdown: &ShutdownSignal) -> [JoinHandle<()>; 2] {
        let mw = &self.config.middleware;
        [
            self.components.rate_limit.spawn_reaper(
                Duration::from_secs(mw.rate.reap_interval_secs),
                Duration::from_secs(mw.rate.idle_secs),
                shutdown.child_token(),
            ),
            self.components.cache.store().spawn_reaper(
                Duration::from_secs(mw.cache.purge_interval_secs),
                shutdown.child_token(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use meridian_core::{BoxFuture, Context, Handler};
    use meridian_middleware::Lookup;
    use meridian_server::Protocol;
    use meridian_test::TestClient;
    use serde_json::json;
    use std::io::Write as _;

    struct Hello;

    impl Handler for Hello {
        fn name(&self) -> &'static str {
            "hello"
        }

        fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let _ = ctx.text(StatusCode::OK, "hello").await;
            })
        }
    }

    #[test]
    fn test_server_config_mapping() {
        let mut config = MeridianConfig::default();
        config.server.http_addr = "127.0.0.1:9000".to_string();
        config.server.protocol = Protocol::FastCgi;
        config.server.keep_alive_secs = None;
        config.server.read_timeout_ms = Some(1500);
        config.server.max_connections = Some(64);

        let server = server_config(&config);
        assert_eq!(server.http_addr(), "127.0.0.1:9000");
        assert_eq!(server.protocol(), Protocol::FastCgi);
        assert_eq!(server.keep_alive_timeout(), None);
        assert_eq!(server.read_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(server.max_connections(), Some(64));
        assert_eq!(server.response_buffer(), 2048);
    }

    #[test]
    fn test_telemetry_config_mapping() {
        let telemetry = telemetry_config(&MeridianConfig::development());
        assert!(!telemetry.logging.json_format);
        assert!(telemetry.logging.file_line_info);
        assert_eq!(telemetry.logging.level, "debug");

        let telemetry = telemetry_config(&MeridianConfig::production());
        assert!(telemetry.logging.json_format);
        assert_eq!(telemetry.metrics.addr.as_deref(), Some("0.0.0.0:9090"));
    }

    #[test]
    fn test_components_follow_config() {
        let mut config = MeridianConfig::default();
        config.middleware.timeout.request_ms = None;
        config.middleware.rate.max = 3;
        let components = Components::from_config(&config);
        assert!(components.timeout.is_none());
        assert_eq!(components.rate_limit.config().burst(), 3);
        assert_eq!(components.policies.guest(), "guest");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reapers_purge_expired_cache_entries() {
        let mut config = MeridianConfig::default();
        config.middleware.cache.ttl_secs = 1;
        config.middleware.cache.purge_interval_secs = 5;
        let app = App::from_config(config).await.unwrap();
        let store = app.components().cache.store().clone();

        let shutdown = ShutdownSignal::new();
        let cancel = shutdown.child_token();
        for i in 0..100 {
            if let Ok(Lookup::Miss(flight)) = store.acquire(&format!("GET /x?n={i}"), &cancel).await {
                flight.complete(StatusCode::OK, http::HeaderMap::new(), bytes::Bytes::new());
            }
        }
        assert_eq!(store.len(), 100);

        let reapers = app.spawn_reapers(&shutdown);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(store.is_empty());

        shutdown.trigger();
        for reaper in reapers {
            reaper.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_policy_file_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            json!({
                "policies": [{"name": "ops", "statements": [
                    {"effect": "allow", "action": ["*"], "resource": ["*"]}
                ]}],
                "members": [{"user": "root", "policy": ["ops"]}]
            })
        )
        .unwrap();

        let mut config = MeridianConfig::default();
        config.pbac.policy_file = Some(file.path().to_path_buf());
        let app = App::from_config(config).await.unwrap();
        assert!(app.components().policies.policy("ops").is_some());
        assert!(app.components().policies.member("root").is_some());
    }

    #[tokio::test]
    async fn test_missing_policy_file_fails() {
        let mut config = MeridianConfig::default();
        config.pbac.policy_file = Some("/nonexistent/policies.json".into());
        let err = App::from_config(config).await.unwrap_err();
        assert!(err.to_string().contains("loading policy file"));
    }

    #[tokio::test]
    async fn test_admin_black_list_applies_globally() {
        let mut app = App::from_config(MeridianConfig::default()).await.unwrap();
        app.get("/hello", Hello).unwrap();
        app.mount_admin("/admin").unwrap();
        let client = TestClient::new(app.into_routes());

        let response = client.get("/hello").send().await;
        response.assert_status(StatusCode::OK).assert_body_eq("hello");
        assert!(response.header("x-request-id").is_some());

        client
            .put("/admin/black/deny/10.0.0.0?mask=8")
            .send()
            .await
            .assert_status(StatusCode::CREATED);

        client
            .get("/hello")
            .remote_addr("10.2.3.4:5000".parse().unwrap())
            .send()
            .await
            .assert_status(StatusCode::FORBIDDEN);
        client.get("/hello").send().await.assert_status(StatusCode::OK);
    }

    #[tokio::test]
    async fn test_breaker_stage_shares_admin_store() {
        let mut app = App::from_config(MeridianConfig::default()).await.unwrap();
        let breaker = app.components().breaker();
        app.get("/flaky", Chain::from(breaker).with(Hello)).unwrap();
        app.mount_admin("").unwrap();
        let client = TestClient::new(app.into_routes());

        client.get("/flaky").send().await.assert_status(StatusCode::OK);
        client
            .get("/breaker/data")
            .send()
            .await
            .assert_json_field("0.name", &json!("/flaky"))
            .assert_json_field("0.total_successes", &json!(1));
    }
}
