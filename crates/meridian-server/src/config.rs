//! Server configuration.
//!
//! # Example
//!
//! ```rust
//! use meridian_server::{Protocol, ServerConfig};
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .http_addr("127.0.0.1:9000")
//!     .protocol(Protocol::FastCgi)
//!     .shutdown_timeout(Duration::from_secs(10))
//!     .build();
//!
//! assert_eq!(config.http_addr(), "127.0.0.1:9000");
//! assert_eq!(config.response_buffer(), 2048);
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default bind address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default idle keep-alive timeout in seconds.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 75;

/// Default limit for the request line plus headers.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Default response buffer; larger responses without a length go chunked.
pub const DEFAULT_RESPONSE_BUFFER: usize = 2048;

/// Default `Server` header value.
pub const DEFAULT_SERVER_NAME: &str = "meridian";

/// The wire protocol a listener speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1, plus HTTP/2 prior knowledge when enabled.
    #[default]
    Http,
    /// FastCGI responder.
    #[serde(rename = "fastcgi")]
    FastCgi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::FastCgi => "fastcgi",
        })
    }
}

/// Error for an unknown protocol name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol '{0}', expected http or fastcgi")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "fastcgi" | "fcgi" => Ok(Self::FastCgi),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

/// Server configuration.
///
/// Use [`ServerConfig::builder()`] to construct instances.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    http_addr: String,
    protocol: Protocol,
    http2_enabled: bool,
    shutdown_timeout: Duration,
    keep_alive_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    max_header_bytes: usize,
    response_buffer: usize,
    server_name: String,
    max_connections: Option<usize>,
}

impl ServerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// The bind address.
    #[must_use]
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Parses the bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.http_addr.parse()
    }

    /// The wire protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether HTTP/2 prior-knowledge connections are accepted.
    #[must_use]
    pub fn http2_enabled(&self) -> bool {
        self.http2_enabled
    }

    /// How long shutdown waits for in-flight connections.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// How long an idle keep-alive connection is held open.
    #[must_use]
    pub fn keep_alive_timeout(&self) -> Option<Duration> {
        self.keep_alive_timeout
    }

    /// Deadline for reading a request header block.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// Limit for the request line plus headers.
    #[must_use]
    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// Size of the per-response write buffer.
    #[must_use]
    pub fn response_buffer(&self) -> usize {
        self.response_buffer
    }

    /// Value injected as the `Server` header.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Connection limit, if any.
    #[must_use]
    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfigBuilder {
    /// Creates a builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig {
                http_addr: DEFAULT_HTTP_ADDR.to_string(),
                protocol: Protocol::Http,
                http2_enabled: true,
                shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
                keep_alive_timeout: Some(Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS)),
                read_timeout: None,
                max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
                response_buffer: DEFAULT_RESPONSE_BUFFER,
                server_name: DEFAULT_SERVER_NAME.to_string(),
                max_connections: None,
            },
        }
    }

    /// Sets the bind address, e.g. `127.0.0.1:3000`.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.http_addr = addr.into();
        self
    }

    /// Sets the wire protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Enables or disables HTTP/2 prior knowledge.
    #[must_use]
    pub fn http2_enabled(mut self, enabled: bool) -> Self {
        self.config.http2_enabled = enabled;
        self
    }

    /// Sets the graceful shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Sets the idle keep-alive timeout; `None` waits indefinitely.
    #[must_use]
    pub fn keep_alive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    /// Sets the header read deadline.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Sets the header size limit.
    #[must_use]
    pub fn max_header_bytes(mut self, bytes: usize) -> Self {
        self.config.max_header_bytes = bytes;
        self
    }

    /// Sets the response buffer size. Zero is raised to one byte.
    #[must_use]
    pub fn response_buffer(mut self, bytes: usize) -> Self {
        self.config.response_buffer = bytes.max(1);
        self
    }

    /// Sets the `Server` header value.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Limits concurrent connections.
    #[must_use]
    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}
