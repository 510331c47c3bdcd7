//! Middleware stages.
//!
//! Every stage is a [`Handler`](meridian_core::Handler) and is mounted with
//! `Chain::with` or a router's `use_global`. Nothing here fixes an order;
//! the usual arrangement is:
//!
//! ```text
//! recovery → request_id → access_log → ip_filter → rate_limit → cors
//!          → auth → resource → pbac → cache → compression → handler
//! ```
//!
//! Stages that short-circuit answer through `Context::fail`, so rejections
//! share the JSON error envelope.

pub mod access_log;
pub mod auth;
pub mod breaker;
pub mod cache;
#[cfg(feature = "compression")]
pub mod compression;
pub mod cors;
pub mod csrf;
pub mod ip_filter;
pub mod rate_limit;
pub mod recovery;
pub mod referer;
pub mod request_id;
pub mod resource;
pub mod rewrite;
pub mod timeout;
pub mod user_agent;

pub use access_log::AccessLog;
pub use auth::{
    BasicAuth, BearerAuth, Claims, DigestAlgorithm, DigestAuth, HmacSha256, Qop, SigningMethod,
    TokenError, USERID_PARAM, USERNAME_PARAM,
};
pub use breaker::BreakerMiddleware;
pub use cache::{CacheMiddleware, CACHE_STATUS_HEADER};
#[cfg(feature = "compression")]
pub use compression::{
    Algorithm, CompressionBuilder, CompressionConfig, CompressionLevel, CompressionMiddleware,
};
pub use cors::{AllowedOrigins, CorsBuilder, CorsConfig, CorsMiddleware};
pub use csrf::CsrfMiddleware;
pub use ip_filter::{IpFilter, IpLists, ListKind};
pub use rate_limit::{KeyExtractor, RateLimitBuilder, RateLimitConfig, RateLimitMiddleware};
pub use recovery::RecoveryMiddleware;
pub use referer::RefererPolicy;
pub use request_id::{RequestIdMiddleware, REQUEST_ID_HEADER};
pub use resource::{ResourceTagger, ACTION_PARAM, RESOURCE_PARAM};
pub use rewrite::Rewrite;
pub use timeout::TimeoutMiddleware;
pub use user_agent::{ClassifierError, UaRule, UserAgent, UserAgentClassifier};
