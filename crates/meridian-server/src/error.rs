//! Server and transport errors.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Why a request could not be read off the wire.
///
/// Errors raised before the header block is complete close the connection
/// silently; later ones are answered with 400.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The request line does not have the `METHOD SP URI SP PROTO` shape.
    #[error("invalid request line")]
    LineInvalid,

    /// The method token is not valid.
    #[error("invalid method")]
    InvalidMethod,

    /// The request target does not parse as a URI.
    #[error("invalid request uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The protocol label is not `HTTP/1.0` or `HTTP/1.1`.
    #[error("unsupported protocol '{0}'")]
    UnsupportedVersion(String),

    /// The request line and headers exceed the configured limit.
    #[error("request header exceeds {limit} bytes")]
    HeaderTooLarge {
        /// The configured limit.
        limit: usize,
    },

    /// A header line is malformed.
    #[error("invalid header line")]
    InvalidHeader,

    /// `Content-Length` is not a number or disagrees with itself.
    #[error("invalid content-length")]
    InvalidContentLength,

    /// A transfer coding other than `chunked` was requested.
    #[error("unsupported transfer-encoding '{0}'")]
    UnsupportedTransferEncoding(String),

    /// A chunk size line or terminator is malformed.
    #[error("invalid chunk framing")]
    InvalidChunk,

    /// A FastCGI record could not be decoded.
    #[error("invalid fastcgi record: {0}")]
    InvalidRecord(&'static str),

    /// The peer closed the connection mid-request.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Reading from the connection failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Returns `true` when the peer simply went away.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::UnexpectedEof => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => err,
            ProtocolError::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Errors running a server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// The configured address does not parse.
    #[error("invalid address '{addr}': {source}")]
    InvalidAddr {
        /// The configured address.
        addr: String,
        /// Parse failure.
        #[source]
        source: std::net::AddrParseError,
    },

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address.
        addr: SocketAddr,
        /// I/O failure.
        #[source]
        source: io::Error,
    },

    /// A connection failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The HTTP/2 connection failed.
    #[error("http/2 connection error: {0}")]
    Http2(#[from] hyper::Error),

    /// An I/O error outside a connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_detection() {
        assert!(ProtocolError::UnexpectedEof.is_disconnect());
        assert!(ProtocolError::Io(io::ErrorKind::ConnectionReset.into()).is_disconnect());
        assert!(!ProtocolError::LineInvalid.is_disconnect());
    }

    #[test]
    fn test_into_io_error_kind() {
        let err: io::Error = ProtocolError::InvalidChunk.into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err: io::Error = ProtocolError::UnexpectedEof.into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
