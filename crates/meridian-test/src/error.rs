//! Test helper errors.

use thiserror::Error;

/// Errors raised by the test client and test server.
#[derive(Debug, Error)]
pub enum TestError {
    /// The request could not be assembled.
    #[error("request build error: {0}")]
    RequestBuild(String),

    /// The response body is not what the caller asked for.
    #[error("body read error: {0}")]
    BodyRead(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A raw response did not parse as HTTP/1.x.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer took too long.
    #[error("timed out waiting for the server")]
    Timeout,
}
