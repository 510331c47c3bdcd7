//! HTTP/1.x response framing.
//!
//! Writes accumulate in a fixed-size buffer. A response that completes
//! within the buffer is sent with a computed `Content-Length`. One that
//! overflows it is switched to chunked encoding (or close-delimited for
//! HTTP/1.0) and the buffered bytes go out as one chunk together with the
//! write that overflowed.

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::BytesMut;
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRAILER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use meridian_core::io::SharedConn;
use meridian_core::{BoxFuture, HijackError, Hijacked, ResponseWriter};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::body::SharedExchange;

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimit {
    /// Head not sent yet.
    Pending,
    /// `Content-Length`; the value is the number of bytes still allowed.
    Length(u64),
    Chunked,
    /// HTTP/1.0 without a length: the connection close ends the body.
    Close,
    /// HEAD, 1xx, 204 and 304 responses.
    NoBody,
}

/// Per-response settings from the connection.
#[derive(Debug, Clone)]
pub(crate) struct WriterSettings {
    pub version: Version,
    pub head_request: bool,
    pub buffer_size: usize,
    pub server_name: Option<HeaderValue>,
}

/// Response writer over an HTTP/1.x connection.
pub(crate) struct Http1Writer {
    conn: SharedConn,
    exchange: SharedExchange,
    cancel: CancellationToken,
    settings: Arc<WriterSettings>,
    headers: HeaderMap,
    status: StatusCode,
    header_written: bool,
    buffer: BytesMut,
    delimit: Delimit,
    /// Body bytes a HEAD response would have carried.
    suppressed: u64,
    size: u64,
    hijacked: bool,
    finished: bool,
}

impl Http1Writer {
    pub fn new(
        conn: SharedConn,
        exchange: SharedExchange,
        cancel: CancellationToken,
        settings: Arc<WriterSettings>,
    ) -> Self {
        let buffer = BytesMut::with_capacity(settings.buffer_size);
        Self {
            conn,
            exchange,
            cancel,
            settings,
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            header_written: false,
            buffer,
            delimit: Delimit::Pending,
            suppressed: 0,
            size: 0,
            hijacked: false,
            finished: false,
        }
    }

    fn bodyless(&self) -> bool {
        self.settings.head_request
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    fn declared_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Decides the framing and serialises the status line and headers.
    ///
    /// `complete` is true when the whole body is in the buffer.
    fn head(&mut self, complete: bool) -> Vec<u8> {
        // An unanswered 100-continue means the body will never be read.
        let mut close = {
            let exchange = self.exchange.lock();
            exchange.close || exchange.expect_continue
        };
        if self
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            close = true;
        }

        self.delimit = if self.bodyless() {
            if self.settings.head_request && complete && self.declared_length().is_none() {
                let length = self.suppressed + self.buffer.len() as u64;
                self.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            Delimit::NoBody
        } else if let Some(length) = self.declared_length() {
            self.headers.remove(TRANSFER_ENCODING);
            Delimit::Length(length)
        } else if complete {
            self.headers
                .insert(CONTENT_LENGTH, HeaderValue::from(self.buffer.len() as u64));
            Delimit::Length(self.buffer.len() as u64)
        } else if self.settings.version == Version::HTTP_10 {
            close = true;
            Delimit::Close
        } else {
            self.headers
                .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            Delimit::Chunked
        };
        if self.bodyless() {
            self.buffer.clear();
        }

        if !self.headers.contains_key(DATE) {
            let now = httpdate::fmt_http_date(SystemTime::now());
            if let Ok(value) = HeaderValue::from_str(&now) {
                self.headers.insert(DATE, value);
            }
        }
        if let Some(server) = &self.settings.server_name {
            if !self.headers.contains_key(SERVER) {
                self.headers.insert(SERVER, server.clone());
            }
        }
        if close {
            self.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if self.settings.version == Version::HTTP_10 {
            self.headers
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        {
            let mut exchange = self.exchange.lock();
            exchange.close = close;
            exchange.response_started = true;
        }

        let proto = if self.settings.version == Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(proto.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Frames `body` per the chosen delimiting and appends it to `out`.
    /// Returns the number of body bytes framed.
    fn frame(&mut self, out: &mut Vec<u8>, body: &[u8]) -> io::Result<u64> {
        if body.is_empty() {
            return Ok(0);
        }
        match self.delimit {
            Delimit::NoBody => Ok(0),
            Delimit::Pending => Err(io::Error::other("response head not sent")),
            Delimit::Length(allowed) => {
                if body.len() as u64 > allowed {
                    self.exchange.lock().close = true;
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "response body exceeds content-length",
                    ));
                }
                self.delimit = Delimit::Length(allowed - body.len() as u64);
                out.extend_from_slice(body);
                Ok(body.len() as u64)
            }
            Delimit::Close => {
                out.extend_from_slice(body);
                Ok(body.len() as u64)
            }
            Delimit::Chunked => {
                out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
                out.extend_from_slice(body);
                out.extend_from_slice(b"\r\n");
                Ok(body.len() as u64)
            }
        }
    }

    async fn send(&mut self, out: &[u8], flush: bool) -> io::Result<()> {
        if out.is_empty() && !flush {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let io = conn.get_mut();
        let result = async {
            io.write_all(out).await?;
            if flush {
                io.flush().await?;
            }
            Ok(())
        }
        .await;
        if result.is_err() {
            self.exchange.lock().close = true;
            self.cancel.cancel();
        }
        result
    }

    /// Emits the head (if needed) followed by the buffer and `extra` as a
    /// single framed segment.
    async fn emit(&mut self, extra: &[u8], flush: bool) -> io::Result<()> {
        let mut out = Vec::new();
        if self.delimit == Delimit::Pending {
            out = self.head(false);
        }
        let mut segment = std::mem::take(&mut self.buffer);
        segment.extend_from_slice(extra);
        let framed = self.frame(&mut out, &segment);
        segment.clear();
        self.buffer = segment;
        let framed = framed?;
        self.send(&out, flush).await?;
        self.size += framed;
        Ok(())
    }

    fn trailers(&self) -> Vec<u8> {
        let mut out = b"0\r\n".to_vec();
        let names = self
            .headers
            .get_all(TRAILER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|n| !n.is_empty());
        for name in names {
            for value in self.headers.get_all(name) {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ResponseWriter for Http1Writer {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn write_header(&mut self, status: StatusCode) {
        if !self.header_written {
            self.status = status;
            self.header_written = true;
        }
    }

    fn header_written(&self) -> bool {
        self.header_written
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if self.hijacked || self.finished {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "response closed"));
            }
            self.write_header(StatusCode::OK);
            if self.bodyless() {
                self.suppressed += data.len() as u64;
                return Ok(data.len());
            }
            let allowed = match self.delimit {
                Delimit::Length(allowed) => Some(allowed),
                Delimit::Pending => self.declared_length(),
                _ => None,
            };
            if allowed.is_some_and(|allowed| (self.buffer.len() + data.len()) as u64 > allowed) {
                self.exchange.lock().close = true;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "response body exceeds content-length",
                ));
            }
            if self.buffer.len() + data.len() > self.settings.buffer_size {
                self.emit(data, false).await?;
            } else {
                self.buffer.extend_from_slice(data);
            }
            Ok(data.len())
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.hijacked || self.finished {
                return Ok(());
            }
            self.write_header(StatusCode::OK);
            self.emit(&[], true).await
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if self.hijacked || self.finished {
                return Ok(());
            }
            self.finished = true;

            let mut out = Vec::new();
            if self.delimit == Delimit::Pending {
                out = self.head(true);
            }
            let segment = std::mem::take(&mut self.buffer);
            let framed = self.frame(&mut out, &segment)?;
            match self.delimit {
                Delimit::Chunked => {
                    let trailers = self.trailers();
                    out.extend_from_slice(&trailers);
                }
                Delimit::Length(left) if left > 0 => {
                    tracing::debug!(missing = left, "response shorter than its content-length");
                    self.exchange.lock().close = true;
                }
                _ => {}
            }
            self.send(&out, true).await?;
            self.size += framed;
            Ok(())
        })
    }

    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked);
        }
        let guard = Arc::clone(&self.conn)
            .try_lock_owned()
            .map_err(|_| HijackError::Busy)?;
        self.hijacked = true;
        self.exchange.lock().close = true;
        Ok(Hijacked::new(guard, self.cancel.clone()))
    }

    fn is_hijacked(&self) -> bool {
        self.hijacked
    }
}
