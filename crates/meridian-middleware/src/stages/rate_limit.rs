//! Rate limiting middleware.
//!
//! Each client key gets its own [`RateBucket`]. A request takes one token;
//! when none is available the request is either rejected with
//! `429 Too Many Requests` or, in waiting mode, held until a token frees up
//! within the configured wait.
//!
//! ## Keys
//!
//! - **Per-IP** (default): the real client IP (`X-Forwarded-For`,
//!   `X-Real-IP`, then the peer address)
//! - **Per-header**: the value of a request header, e.g. an API key
//! - **Per-param**: a context param such as `username` set by an auth stage
//! - **Global**: a single bucket for all requests
//! - **Custom**: any function of the context
//!
//! Idle buckets are removed by a reaper task started with
//! [`RateLimitMiddleware::spawn_reaper`].
//!
//! ## Example
//!
//! ```
//! use meridian_middleware::stages::RateLimitMiddleware;
//!
//! let rate_limit = RateLimitMiddleware::builder()
//!     .speed(5.0)
//!     .burst(10)
//!     .per_header("x-api-key")
//!     .build();
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use http::HeaderValue;
use meridian_core::{BoxFuture, Context, Handler, MeridianError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bucket::RateBucket;

/// Rate limit header names.
pub mod headers {
    /// Bucket capacity.
    pub const LIMIT: &str = "x-ratelimit-limit";
    /// Seconds to wait before retrying (on 429).
    pub const RETRY_AFTER: &str = "retry-after";
}

/// Shortest `Retry-After` sent, so rejected clients do not spin.
pub const MIN_RETRY_AFTER_SECS: u64 = 3;

/// How to derive the bucket key from a request.
#[derive(Clone, Default)]
pub enum KeyExtractor {
    /// Client IP address.
    #[default]
    Ip,
    /// A request header value.
    Header(String),
    /// A context param.
    Param(String),
    /// A custom function of the context.
    Custom(Arc<dyn Fn(&Context) -> Option<String> + Send + Sync>),
    /// A single bucket shared by every request.
    Global,
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "KeyExtractor::Ip"),
            Self::Header(h) => f.debug_tuple("KeyExtractor::Header").field(h).finish(),
            Self::Param(p) => f.debug_tuple("KeyExtractor::Param").field(p).finish(),
            Self::Custom(_) => write!(f, "KeyExtractor::Custom(<fn>)"),
            Self::Global => write!(f, "KeyExtractor::Global"),
        }
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens refilled per second.
    speed: f64,
    /// Bucket capacity in tokens.
    burst: u32,
    /// How to key buckets.
    key_extractor: KeyExtractor,
    /// Hold requests up to this long instead of rejecting immediately.
    max_wait: Option<Duration>,
    /// Message returned when rate limited.
    error_message: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            speed: 10.0,
            burst: 20,
            key_extractor: KeyExtractor::default(),
            max_wait: None,
            error_message: "Too many requests. Please try again later.".to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Tokens refilled per second.
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Bucket capacity.
    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst
    }
}

/// Builder for [`RateLimitMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct RateLimitBuilder {
    config: RateLimitConfig,
}

impl RateLimitBuilder {
    /// Creates a builder with default settings (10/s, burst 20, per IP).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the refill rate in tokens per second.
    #[must_use]
    pub fn speed(mut self, per_second: f64) -> Self {
        self.config.speed = per_second;
        self
    }

    /// Sets the bucket capacity.
    #[must_use]
    pub fn burst(mut self, tokens: u32) -> Self {
        self.config.burst = tokens;
        self
    }

    /// Keys buckets by client IP.
    #[must_use]
    pub fn per_ip(mut self) -> Self {
        self.config.key_extractor = KeyExtractor::Ip;
        self
    }

    /// Keys buckets by a header value.
    #[must_use]
    pub fn per_header(mut self, header_name: impl Into<String>) -> Self {
        self.config.key_extractor = KeyExtractor::Header(header_name.into());
        self
    }

    /// Keys buckets by a context param (e.g. `username`).
    #[must_use]
    pub fn per_param(mut self, name: impl Into<String>) -> Self {
        self.config.key_extractor = KeyExtractor::Param(name.into());
        self
    }

    /// Uses one bucket for all requests.
    #[must_use]
    pub fn global(mut self) -> Self {
        self.config.key_extractor = KeyExtractor::Global;
        self
    }

    /// Uses a custom key function. Requests yielding `None` are not limited.
    #[must_use]
    pub fn key_extractor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> Option<String> + Send + Sync + 'static,
    {
        self.config.key_extractor = KeyExtractor::Custom(Arc::new(f));
        self
    }

    /// Waits up to `max_wait` for a token before rejecting.
    #[must_use]
    pub fn wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait = Some(max_wait);
        self
    }

    /// Sets the error message returned when rate limited.
    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.config.error_message = message.into();
        self
    }

    /// Builds the middleware.
    #[must_use]
    pub fn build(self) -> RateLimitMiddleware {
        RateLimitMiddleware {
            config: self.config,
            buckets: Arc::new(DashMap::new()),
        }
    }
}

/// Token-bucket rate limiting middleware.
///
/// Clones share their buckets.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    buckets: Arc<DashMap<String, Arc<RateBucket>>>,
}

impl RateLimitMiddleware {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> RateLimitBuilder {
        RateLimitBuilder::new()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn extract_key(&self, ctx: &Context) -> Option<String> {
        match &self.config.key_extractor {
            KeyExtractor::Ip => Some(
                ctx.real_ip()
                    .map_or_else(|| "unknown-ip".to_string(), |ip| ip.to_string()),
            ),
            KeyExtractor::Header(name) => ctx.request().header(name.as_str()).map(String::from),
            KeyExtractor::Param(name) => ctx.param(name).map(String::from),
            KeyExtractor::Custom(f) => f(ctx),
            KeyExtractor::Global => Some("global".to_string()),
        }
    }

    fn bucket(&self, key: &str) -> Arc<RateBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateBucket::per_second(self.config.speed, self.config.burst)));
        Arc::clone(bucket.value())
    }

    /// Removes buckets idle for longer than `idle`. Returns how many were
    /// removed.
    pub fn reap(&self, idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_for() < idle);
        before - self.buckets.len()
    }

    /// Starts a task that reaps idle buckets every `interval` until
    /// `shutdown` fires.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.reap(idle);
                        if removed > 0 {
                            tracing::debug!(removed, "reaped idle rate buckets");
                        }
                    }
                }
            }
        })
    }
}

fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(MIN_RETRY_AFTER_SECS)
}

impl Handler for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(key) = self.extract_key(ctx) else {
                return;
            };
            let bucket = self.bucket(&key);

            ctx.writer()
                .headers_mut()
                .insert(headers::LIMIT, HeaderValue::from(bucket.capacity()));

            let (wait, ok) = bucket.allow(1);
            if ok {
                return;
            }

            if let Some(max_wait) = self.config.max_wait {
                let deadline = tokio::time::Instant::now() + max_wait;
                let cancel = ctx.cancellation().clone();
                if bucket.wait(1, deadline, &cancel).await.is_ok() {
                    return;
                }
            }

            metrics::counter!("meridian_rate_limited_total").increment(1);
            ctx.fail(MeridianError::rate_limited(
                self.config.error_message.clone(),
                Some(retry_after_secs(wait)),
            ))
            .await;
        })
    }
}
