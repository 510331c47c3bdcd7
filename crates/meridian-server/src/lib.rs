//! # Meridian Server
//!
//! Transports and the accept loop for Meridian applications.
//!
//! - HTTP/1.x with a buffered response writer: small responses get a
//!   `Content-Length`, larger ones stream as chunks
//! - HTTP/2 prior knowledge, served by hyper behind the same
//!   [`Context`](meridian_core::Context) abstraction
//! - FastCGI responder role
//! - A [`Routes`] table with 404/405 chains and global middleware
//! - Graceful shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use meridian_core::named_fn;
//! use meridian_server::{Protocol, Routes, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut routes = Routes::new();
//!     routes.get("/users/:id", named_fn("user", |ctx| Box::pin(async move {
//!         let id = ctx.param("id").unwrap_or_default().to_string();
//!         let _ = ctx.text(StatusCode::OK, &id).await;
//!     })))?;
//!
//!     let config = ServerConfig::builder()
//!         .http_addr("127.0.0.1:9000")
//!         .protocol(Protocol::FastCgi)
//!         .build();
//!     Server::new(config, routes).run().await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/meridian-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
pub mod fcgi;
pub mod h2;
pub mod http1;
mod rewind;
mod routes;
mod server;
mod shutdown;

pub use config::{
    Protocol, ServerConfig, ServerConfigBuilder, UnknownProtocol, DEFAULT_HTTP_ADDR,
    DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_HEADER_BYTES, DEFAULT_RESPONSE_BUFFER,
    DEFAULT_SERVER_NAME, DEFAULT_SHUTDOWN_TIMEOUT_SECS,
};
pub use error::{ProtocolError, ServerError, ServerResult};
pub use rewind::{Rewind, H2_PREFACE};
pub use routes::{Routes, ROUTE_PARAM};
pub use server::Server;
pub use shutdown::{ConnectionGuard, ConnectionTracker, ShutdownSignal};
