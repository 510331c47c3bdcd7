//! # Meridian
//!
//! A web application runtime for HTTP/1.1, HTTP/2 (h2c) and FastCGI.
//!
//! Requests are dispatched through a radix-tree router to chains of
//! handlers. Around that core sit the production middleware (rate limiting,
//! circuit breaking, caching, compression, CORS, CSRF, rewrite,
//! authentication) and a policy-based access-control engine.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meridian::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = meridian::load_config()?;
//!     let mut app = meridian::bootstrap(config).await?;
//!
//!     let rate = app.components().rate_limit.clone();
//!     app.routes_mut().get(
//!         "/users/:id<isnum>",
//!         Chain::from(rate).with(named_fn("user", |ctx| {
//!             Box::pin(async move {
//!                 let id = ctx.param("id").unwrap_or_default().to_string();
//!                 let _ = ctx.text(StatusCode::OK, &id).await;
//!             })
//!         })),
//!     )?;
//!     app.mount_admin("/admin")?;
//!
//!     app.run().await
//! }
//! ```
//!
//! ## Crates
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`router`] | route trees, validators, `MatchTree` |
//! | [`core`] | `Context`, `Handler`, `Chain`, errors, response writers |
//! | [`middleware`] | middleware stages and their shared stores |
//! | [`pbac`] | policies, members and the PBAC stage |
//! | [`server`] | transports, `Routes`, `Server`, shutdown |
//! | [`telemetry`] | logging and Prometheus metrics |
//! | [`config`] | layered configuration |

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub use meridian_config as config;
pub use meridian_core as core;
pub use meridian_middleware as middleware;
pub use meridian_pbac as pbac;
pub use meridian_router as router;
pub use meridian_server as server;
pub use meridian_telemetry as telemetry;

pub mod admin;
mod app;

pub use app::{
    bootstrap, load_config, load_config_from, server_config, telemetry_config, App, Components,
    CONFIG_FILE, ENV_PREFIX,
};

/// Common imports.
///
/// ```rust,ignore
/// use meridian::prelude::*;
/// ```
pub mod prelude {
    pub use crate::admin::Admin;
    pub use crate::{bootstrap, App, Components};

    pub use http::{Method, StatusCode};
    pub use meridian_config::{ConfigLoader, MeridianConfig};
    pub use meridian_core::{
        handler_fn, named_fn, BoxFuture, Chain, Context, Handler, MeridianError, MeridianResult,
        Request,
    };
    pub use meridian_middleware::stages::{
        AccessLog, BreakerMiddleware, CacheMiddleware, CompressionMiddleware, CorsMiddleware,
        CsrfMiddleware, IpFilter, RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware,
        TimeoutMiddleware,
    };
    pub use meridian_pbac::{PbacMiddleware, PolicyStore};
    pub use meridian_server::{Routes, Server, ServerConfig, ShutdownSignal};
}
