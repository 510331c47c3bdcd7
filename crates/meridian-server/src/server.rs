//! The accept loop.
//!
//! A [`Server`] owns a [`ServerConfig`] and a [`Routes`] table. Each
//! accepted connection is served on its own task by the transport the
//! configuration selects; shutdown stops accepting, lets idle connections
//! close, and waits up to the shutdown timeout for busy ones.
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use meridian_core::named_fn;
//! use meridian_server::{Routes, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), meridian_server::ServerError> {
//! let mut routes = Routes::new();
//! routes
//!     .get("/hello", named_fn("hello", |ctx| Box::pin(async move {
//!         let _ = ctx.text(StatusCode::OK, "hello").await;
//!     })))
//!     .expect("valid pattern");
//!
//! let config = ServerConfig::builder().http_addr("127.0.0.1:8080").build();
//! Server::new(config, routes).run().await
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use meridian_core::io::AsyncIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{Protocol, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::rewind::Rewind;
use crate::routes::Routes;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::{fcgi, h2, http1};

/// A configured server.
pub struct Server {
    config: Arc<ServerConfig>,
    routes: Arc<Routes>,
}

impl Server {
    /// Creates a server serving `routes`.
    pub fn new(config: ServerConfig, routes: Routes) -> Self {
        Self {
            config: Arc::new(config),
            routes: Arc::new(routes),
        }
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The route table.
    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Binds the configured address and serves until SIGTERM or SIGINT.
    pub async fn run(self) -> ServerResult<()> {
        self.run_with_shutdown(ShutdownSignal::with_os_signals()).await
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run_with_shutdown(self, shutdown: ShutdownSignal) -> ServerResult<()> {
        let addr = self
            .config
            .socket_addr()
            .map_err(|source| ServerError::InvalidAddr {
                addr: self.config.http_addr().to_string(),
                source,
            })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections accepted from `listener` until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) -> ServerResult<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            protocol = %self.config.protocol(),
            http2 = self.config.http2_enabled(),
            routes = self.routes.len(),
            "server listening"
        );

        let server = Arc::new(self);
        let tracker = ConnectionTracker::new();
        let limit = server.config.max_connections().map(|max| Arc::new(Semaphore::new(max)));

        loop {
            let permit = match &limit {
                Some(limit) => tokio::select! {
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    () = shutdown.recv() => break,
                },
                None => None,
            };

            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to accept connection");
                        continue;
                    }
                },
                () = shutdown.recv() => break,
            };
            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(error = %err, "failed to set TCP_NODELAY");
            }

            let server = Arc::clone(&server);
            let guard = tracker.acquire();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                match server.serve_io(stream, Some(remote_addr), token).await {
                    Ok(()) => {}
                    Err(ServerError::Protocol(err)) if err.is_disconnect() => {
                        tracing::trace!(%remote_addr, "peer disconnected");
                    }
                    Err(err) => tracing::warn!(%remote_addr, error = %err, "connection failed"),
                }
                drop(permit);
                drop(guard);
            });
        }

        let timeout = server.config.shutdown_timeout();
        tracing::info!(
            active = tracker.active_connections(),
            timeout_secs = timeout.as_secs(),
            "shutting down, waiting for connections"
        );
        tokio::select! {
            () = tracker.wait_idle() => tracing::info!("all connections closed"),
            () = tokio::time::sleep(timeout) => tracing::warn!(
                active = tracker.active_connections(),
                "shutdown timeout reached"
            ),
        }
        tracing::info!("server stopped");
        Ok(())
    }

    /// Serves one already-accepted connection with the configured
    /// transport. `shutdown` closes it between requests.
    pub async fn serve_io(
        &self,
        io: impl AsyncIo,
        remote_addr: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> ServerResult<()> {
        let routes = Arc::clone(&self.routes);
        let config = Arc::clone(&self.config);
        match config.protocol() {
            Protocol::FastCgi => {
                fcgi::serve_connection(io, remote_addr, routes, config, shutdown).await?;
            }
            Protocol::Http if config.http2_enabled() => {
                let sniff = Rewind::sniff_h2(io);
                let sniffed = match config.read_timeout() {
                    Some(wait) => match tokio::time::timeout(wait, sniff).await {
                        Ok(sniffed) => sniffed?,
                        Err(_) => return Ok(()),
                    },
                    None => sniff.await?,
                };
                match sniffed {
                    (true, io) => h2::serve_connection(io, remote_addr, routes, config, shutdown).await?,
                    (false, io) => {
                        http1::serve_connection(io, remote_addr, routes, config, shutdown).await?;
                    }
                }
            }
            Protocol::Http => {
                http1::serve_connection(io, remote_addr, routes, config, shutdown).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use meridian_core::named_fn;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn routes() -> Routes {
        let mut routes = Routes::new();
        routes
            .get("/ping", named_fn("ping", |ctx| {
                Box::pin(async move {
                    let _ = ctx.text(StatusCode::OK, "pong").await;
                })
            }))
            .unwrap();
        routes
    }

    #[tokio::test]
    async fn test_invalid_addr() {
        let config = ServerConfig::builder().http_addr("not an addr").build();
        let err = Server::new(config, routes())
            .run_with_shutdown(ShutdownSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddr { .. }));
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = ShutdownSignal::new();
        let config = ServerConfig::builder()
            .shutdown_timeout(Duration::from_secs(1))
            .build();
        let task = tokio::spawn(Server::new(config, routes()).serve(listener, shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\npong"), "{response}");

        shutdown.trigger();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sniffs_http1_when_h2_enabled() {
        let server = Server::new(ServerConfig::builder().http2_enabled(true).build(), routes());
        let (mut client, io) = tokio::io::duplex(4096);
        let serve = server.serve_io(io, None, CancellationToken::new());

        let exchange = async {
            client
                .write_all(b"GET /ping HTTP/1.0\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            response
        };
        let (served, response) = tokio::join!(serve, exchange);
        served.unwrap();
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    }
}
