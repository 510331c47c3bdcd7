//! A real listener for wire-level tests.

use std::net::SocketAddr;
use std::ops::Deref;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use meridian_server::{Routes, Server, ServerConfig, ShutdownSignal};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::error::TestError;
use crate::response::TestResponse;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves a [`Routes`] table on `127.0.0.1:<ephemeral>`.
///
/// Dropping the server triggers shutdown.
///
/// ```ignore
/// let server = TestServer::start(routes).await?;
/// let mut conn = server.connect().await?;
/// conn.send(b"GET /slices/3 HTTP/1.1\r\nHost: x\r\n\r\n").await?;
/// let response = conn.read_response().await?;
/// assert_eq!(response.chunk_sizes(), &[3000]);
/// ```
#[derive(Debug)]
pub struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownSignal,
    task: Option<JoinHandle<meridian_server::ServerResult<()>>>,
}

impl TestServer {
    /// Starts with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the ephemeral port cannot be bound.
    pub async fn start(routes: Routes) -> Result<Self, TestError> {
        Self::start_with(ServerConfig::default(), routes).await
    }

    /// Starts with `config`; its bind address is ignored.
    ///
    /// # Errors
    ///
    /// Fails if the ephemeral port cannot be bound.
    pub async fn start_with(config: ServerConfig, routes: Routes) -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(Server::new(config, routes).serve(listener, shutdown.clone()));
        Ok(Self {
            addr,
            shutdown,
            task: Some(task),
        })
    }

    /// The bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Opens a raw connection.
    ///
    /// # Errors
    ///
    /// Fails if the connection is refused.
    pub async fn connect(&self) -> Result<TestConnection, TestError> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(TestConnection {
            stream,
            buffer: BytesMut::new(),
        })
    }

    /// Sends `raw` on a fresh connection and reads until the server closes.
    ///
    /// # Errors
    ///
    /// Fails on socket errors or if the server keeps the connection open.
    pub async fn exchange(&self, raw: &[u8]) -> Result<Bytes, TestError> {
        let mut conn = self.connect().await?;
        conn.send(raw).await?;
        conn.read_to_end().await
    }

    /// Triggers shutdown and waits for the serve loop to return.
    ///
    /// # Errors
    ///
    /// Returns the serve loop's error, if any.
    pub async fn stop(mut self) -> Result<(), TestError> {
        self.shutdown.trigger();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result.map_err(|e| TestError::Io(std::io::Error::other(e)))?,
                Err(join) => return Err(TestError::Io(std::io::Error::other(join))),
            }
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// A client socket with response framing helpers.
#[derive(Debug)]
pub struct TestConnection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TestConnection {
    /// Writes raw bytes.
    ///
    /// # Errors
    ///
    /// Fails if the socket is closed.
    pub async fn send(&mut self, raw: &[u8]) -> Result<(), TestError> {
        self.stream.write_all(raw).await?;
        Ok(())
    }

    /// Reads everything until the server closes the connection.
    ///
    /// # Errors
    ///
    /// Fails on socket errors or after five seconds.
    pub async fn read_to_end(&mut self) -> Result<Bytes, TestError> {
        let mut rest = Vec::new();
        tokio::time::timeout(READ_TIMEOUT, self.stream.read_to_end(&mut rest))
            .await
            .map_err(|_| TestError::Timeout)??;
        self.buffer.extend_from_slice(&rest);
        Ok(self.buffer.split().freeze())
    }

    /// Returns `true` once the server has closed its side.
    ///
    /// # Errors
    ///
    /// Fails on socket errors or after five seconds without data or EOF.
    pub async fn is_closed(&mut self) -> Result<bool, TestError> {
        if !self.buffer.is_empty() {
            return Ok(false);
        }
        Ok(self.fill().await? == 0)
    }

    /// Reads one response framed by `Content-Length`, chunked encoding, or
    /// connection close. Interim `1xx` responses are returned on their own.
    ///
    /// # Errors
    ///
    /// Fails on malformed framing, socket errors or a stalled server.
    pub async fn read_response(&mut self) -> Result<WireResponse, TestError> {
        self.read_response_to(false).await
    }

    /// Reads the response to a `HEAD` request: headers only.
    ///
    /// # Errors
    ///
    /// See [`read_response`](Self::read_response).
    pub async fn read_head_response(&mut self) -> Result<WireResponse, TestError> {
        self.read_response_to(true).await
    }

    async fn read_response_to(&mut self, head_request: bool) -> Result<WireResponse, TestError> {
        let head_end = loop {
            if let Some(pos) = find(&self.buffer, b"\r\n\r\n") {
                break pos;
            }
            if self.fill().await? == 0 {
                return Err(TestError::Malformed("connection closed before head".into()));
            }
        };
        let head = self.buffer.split_to(head_end + 4);
        let head = std::str::from_utf8(&head[..head_end])
            .map_err(|_| TestError::Malformed("head is not UTF-8".into()))?
            .to_string();

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default().to_string();
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .ok_or_else(|| TestError::Malformed(format!("bad status line: {status_line}")))?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TestError::Malformed(format!("bad header line: {line}")))?;
            let name = HeaderName::try_from(name.trim())
                .map_err(|e| TestError::Malformed(e.to_string()))?;
            let value = HeaderValue::try_from(value.trim())
                .map_err(|e| TestError::Malformed(e.to_string()))?;
            headers.append(name, value);
        }

        let mut chunk_sizes = Vec::new();
        let mut trailers = HeaderMap::new();
        let bodiless = head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        let chunked = headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        let body = if bodiless {
            Bytes::new()
        } else if chunked {
            self.read_chunked(&mut chunk_sizes, &mut trailers).await?
        } else if let Some(length) = length {
            self.read_exact(length).await?
        } else {
            self.read_to_end().await?
        };

        Ok(WireResponse {
            status_line,
            chunk_sizes,
            trailers,
            response: TestResponse::new(status, headers, body),
        })
    }

    async fn read_chunked(
        &mut self,
        sizes: &mut Vec<usize>,
        trailers: &mut HeaderMap,
    ) -> Result<Bytes, TestError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size_text = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| TestError::Malformed(format!("bad chunk size: {line}")))?;
            if size == 0 {
                break;
            }
            sizes.push(size);
            body.extend_from_slice(&self.read_exact(size).await?);
            if !self.read_line().await?.is_empty() {
                return Err(TestError::Malformed("chunk not followed by CRLF".into()));
            }
        }
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.trim()),
                    HeaderValue::try_from(value.trim()),
                ) {
                    trailers.append(name, value);
                }
            }
        }
        Ok(body.freeze())
    }

    async fn read_line(&mut self) -> Result<String, TestError> {
        loop {
            if let Some(pos) = find(&self.buffer, b"\r\n") {
                let line = self.buffer.split_to(pos);
                self.buffer.advance(2);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| TestError::Malformed("line is not UTF-8".into()));
            }
            if self.fill().await? == 0 {
                return Err(TestError::Malformed("connection closed mid-line".into()));
            }
        }
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes, TestError> {
        while self.buffer.len() < len {
            if self.fill().await? == 0 {
                return Err(TestError::Malformed(format!(
                    "connection closed after {} of {len} body bytes",
                    self.buffer.len()
                )));
            }
        }
        Ok(self.buffer.split_to(len).freeze())
    }

    async fn fill(&mut self) -> Result<usize, TestError> {
        let mut chunk = [0u8; 8192];
        let n = tokio::time::timeout(READ_TIMEOUT, self.stream.read(&mut chunk))
            .await
            .map_err(|_| TestError::Timeout)??;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

/// A response read off the wire, with framing details.
#[derive(Debug, Clone)]
pub struct WireResponse {
    status_line: String,
    chunk_sizes: Vec<usize>,
    trailers: HeaderMap,
    response: TestResponse,
}

impl WireResponse {
    /// The status line, e.g. `HTTP/1.1 200 OK`.
    #[must_use]
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    /// Sizes of the chunks, in order. Empty unless chunked.
    #[must_use]
    pub fn chunk_sizes(&self) -> &[usize] {
        &self.chunk_sizes
    }

    /// Trailer fields after the last chunk.
    #[must_use]
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Drops the framing details.
    #[must_use]
    pub fn into_response(self) -> TestResponse {
        self.response
    }
}

impl Deref for WireResponse {
    type Target = TestResponse;

    fn deref(&self) -> &TestResponse {
        &self.response
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{named_fn, write_all};

    fn routes() -> Routes {
        let mut routes = Routes::new();
        routes
            .get(
                "/slices/:n",
                named_fn("slices", |ctx| {
                    Box::pin(async move {
                        let n: usize = ctx.param("n").and_then(|n| n.parse().ok()).unwrap_or(0);
                        for _ in 0..n {
                            if write_all(ctx.writer(), &[b'z'; 1000]).await.is_err() {
                                return;
                            }
                        }
                    })
                }),
            )
            .unwrap();
        routes
    }

    #[tokio::test]
    async fn test_chunked_framing_is_reported() {
        let server = TestServer::start(routes()).await.unwrap();
        let mut conn = server.connect().await.unwrap();

        conn.send(b"GET /slices/3 HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        let response = conn.read_response().await.unwrap();
        assert_eq!(response.status_line(), "HTTP/1.1 200 OK");
        assert_eq!(response.chunk_sizes(), &[3000]);
        assert_eq!(response.body().len(), 3000);

        // Same connection, buffered response this time.
        conn.send(b"GET /slices/1 HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        let response = conn.read_response().await.unwrap();
        assert_eq!(response.content_length(), Some(1000));
        assert!(response.chunk_sizes().is_empty());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exchange_with_close() {
        let server = TestServer::start(routes()).await.unwrap();
        let raw = server
            .exchange(b"GET /nope HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        assert!(raw.starts_with(b"HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let server = TestServer::start(routes()).await.unwrap();
        let mut conn = server.connect().await.unwrap();
        conn.send(b"HEAD /slices/1 HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
        let response = conn.read_head_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_length(), Some(1000));
        assert!(response.body().is_empty());
    }
}
