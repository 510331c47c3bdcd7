//! Request bodies.
//!
//! A [`Body`] is consumed at most once. Transports install a streaming
//! reader (length-limited, chunked, HTTP/2 data frames); tests and FastCGI
//! hand over complete buffers.

use std::io;

use bytes::{Bytes, BytesMut};

use crate::handler::BoxFuture;
use crate::MeridianError;

/// A streaming source of request body chunks.
pub trait BodyReader: Send {
    /// Returns the next chunk, or `None` at end of body.
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>>;

    /// Bytes left to read, when known.
    fn remaining(&self) -> Option<u64> {
        None
    }
}

/// The request body.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A complete in-memory body.
    Full(Bytes),
    /// A body read lazily from the transport.
    Stream(Box<dyn BodyReader>),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("Body::Empty"),
            Self::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Full(bytes)
        }
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Bytes::from(v).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl Body {
    /// Returns `true` if no bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Full(bytes) => bytes.is_empty(),
            Self::Stream(reader) => reader.remaining() == Some(0),
        }
    }

    /// Returns the next chunk. After the last chunk the body becomes empty.
    pub async fn chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            Self::Empty => Ok(None),
            Self::Full(_) => match std::mem::take(self) {
                Self::Full(bytes) => Ok(Some(bytes)),
                _ => Ok(None),
            },
            Self::Stream(reader) => {
                let chunk = reader.next_chunk().await?;
                if chunk.is_none() {
                    *self = Self::Empty;
                }
                Ok(chunk)
            }
        }
    }

    /// Reads the whole body, failing once it exceeds `limit` bytes.
    pub async fn bytes(&mut self, limit: usize) -> Result<Bytes, MeridianError> {
        if let Self::Full(bytes) = self {
            if bytes.len() > limit {
                return Err(MeridianError::bad_request("request body too large"));
            }
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            if buf.len() + chunk.len() > limit {
                return Err(MeridianError::bad_request("request body too large"));
            }
            if buf.is_empty() && self.is_exhausted() {
                return Ok(chunk);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads and drops up to `max` bytes. Returns `true` if the body was
    /// fully consumed.
    pub async fn discard(&mut self, max: u64) -> io::Result<bool> {
        let mut seen = 0u64;
        while let Some(chunk) = self.chunk().await? {
            seen += chunk.len() as u64;
            if seen > max {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_exhausted(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Chunks(VecDeque<&'static str>);

    impl BodyReader for Chunks {
        fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<Bytes>>> {
            let next = self.0.pop_front().map(|s| Bytes::from_static(s.as_bytes()));
            Box::pin(async move { Ok(next) })
        }
    }

    fn stream(parts: &[&'static str]) -> Body {
        Body::Stream(Box::new(Chunks(parts.iter().copied().collect())))
    }

    #[tokio::test]
    async fn test_full_body_is_read_once() {
        let mut body = Body::from("hello");
        assert_eq!(body.bytes(1024).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(body.is_empty());
        assert_eq!(body.bytes(1024).await.unwrap(), Bytes::new());
    }

    #[tokio::test]
    async fn test_stream_body_concatenates() {
        let mut body = stream(&["ab", "cd", "e"]);
        assert_eq!(body.bytes(16).await.unwrap(), Bytes::from_static(b"abcde"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let mut body = stream(&["abc", "def"]);
        let err = body.bytes(4).await.unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::BAD_REQUEST);

        let mut body = Body::from("too long");
        assert!(body.bytes(3).await.is_err());
    }

    #[tokio::test]
    async fn test_discard() {
        let mut body = stream(&["abc", "def"]);
        assert!(body.discard(10).await.unwrap());

        let mut body = stream(&["abc", "def"]);
        assert!(!body.discard(4).await.unwrap());
    }
}
