//! Per-request context.
//!
//! A [`Context`] owns everything a handler chain needs for one request: the
//! request view, the (possibly wrapped) response writer, router params, the
//! chain being executed and the position in it.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use http::header::{HeaderName, HeaderValue, ALLOW, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use http::{Extensions, StatusCode};
use meridian_router::Params;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::handler::{BoxFuture, Chain};
use crate::io::{HijackError, Hijacked};
use crate::recorder::{Recording, ResponseRecorder};
use crate::request::Request;
use crate::writer::{write_all, Detached, ResponseWriter};
use crate::MeridianError;

/// Longest incoming request id that is adopted verbatim.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// A request identifier.
///
/// Generated ids are UUID v7, which are time-ordered and sort well in logs.
/// Ids received from a trusted upstream are kept as sent.
///
/// # Example
///
/// ```
/// use meridian_core::RequestId;
///
/// let id = RequestId::new();
/// assert_eq!(id.as_str().len(), 36);
/// assert!(RequestId::parse("upstream-42").is_some());
/// assert!(RequestId::parse("bad id").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Adopts an id received in a header.
    ///
    /// Returns `None` for empty or overlong values and for values containing
    /// anything other than ASCII letters, digits and `-_.:`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let valid = !value.is_empty()
            && value.len() <= MAX_REQUEST_ID_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'));
        valid.then(|| Self(value.to_string()))
    }

    /// The id as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

const ENDED: usize = usize::MAX / 2;

/// Per-request state threaded through the handler chain.
///
/// # Chain semantics
///
/// [`next`](Self::next) runs the remaining handlers in order. A middleware
/// that calls it observes the rest of the chain complete within its own
/// call; one that does not call it simply lets the outer loop continue with
/// the following handler. [`end`](Self::end) is a one-way latch: nothing
/// after the current position runs, but frames already on the stack resume.
pub struct Context {
    request: Request,
    writer: Box<dyn ResponseWriter>,
    wrapped: usize,
    params: Params,
    chain: Chain,
    index: usize,
    extensions: Extensions,
    request_id: Option<RequestId>,
    error: Option<MeridianError>,
    started_at: Instant,
    cancel: CancellationToken,
}

impl Context {
    /// Creates a context for `request` writing to `writer`.
    pub fn new(request: Request, writer: Box<dyn ResponseWriter>) -> Self {
        Self {
            request,
            writer,
            wrapped: 0,
            params: Params::new(),
            chain: Chain::new(),
            index: 0,
            extensions: Extensions::new(),
            request_id: None,
            error: None,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates a context writing into a [`ResponseRecorder`].
    #[must_use]
    pub fn recorded(request: Request) -> (Self, Recording) {
        let (recorder, recording) = ResponseRecorder::new();
        (Self::new(request, Box::new(recorder)), recording)
    }

    /// Ties the context to a cancellation token, usually a child of the
    /// server's shutdown token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // ----- chain ---------------------------------------------------------

    /// Runs `chain` from its first handler.
    pub async fn run(&mut self, chain: Chain) {
        self.set_handler(0, chain);
        self.next().await;
    }

    /// Runs the handlers after the current one.
    pub fn next(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            while let Some(handler) = self.chain.get(self.index).cloned() {
                self.index += 1;
                handler.call(self).await;
            }
        })
    }

    /// Stops the chain after the current handler.
    pub fn end(&mut self) {
        self.index = ENDED;
    }

    /// Returns `true` once [`end`](Self::end) was called or the chain ran out.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.index >= self.chain.len()
    }

    /// Replaces the chain and the position in it.
    pub fn set_handler(&mut self, index: usize, chain: Chain) {
        self.chain = chain;
        self.index = index;
    }

    /// The chain being executed.
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Index of the next handler to run.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    // ----- request -------------------------------------------------------

    /// The request.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Mutable access to the request.
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// The client address, honouring `X-Forwarded-For` and `X-Real-IP`.
    #[must_use]
    pub fn real_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .request
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse().ok());
        forwarded
            .or_else(|| {
                self.request
                    .header("x-real-ip")
                    .and_then(|ip| ip.trim().parse().ok())
            })
            .or_else(|| self.request.remote_addr().map(|addr| addr.ip()))
    }

    // ----- params --------------------------------------------------------

    /// Router and middleware params.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Mutable params.
    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// The last value of param `name`.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// Replaces every value of param `name`.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.set(name, value);
    }

    /// The matched route pattern.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.params.get("route")
    }

    // ----- response ------------------------------------------------------

    /// The active response writer.
    pub fn writer(&mut self) -> &mut dyn ResponseWriter {
        &mut *self.writer
    }

    /// The response status as currently set.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.writer.status()
    }

    /// Returns `true` once the status line was committed.
    #[must_use]
    pub fn header_written(&self) -> bool {
        self.writer.header_written()
    }

    /// Body bytes handed to the transport.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.writer.size()
    }

    /// Sets a response header.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.writer.headers_mut().insert(name, value);
    }

    /// Commits the status.
    pub fn write_header(&mut self, status: StatusCode) {
        self.writer.write_header(status);
    }

    /// Writes body bytes.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        write_all(&mut *self.writer, data).await
    }

    /// Writes a plain text response.
    pub async fn text(&mut self, status: StatusCode, body: &str) -> io::Result<()> {
        self.respond(status, "text/plain; charset=utf-8", body.as_bytes())
            .await
    }

    /// Writes a JSON response.
    pub fn json<T: Serialize + ?Sized>(
        &mut self,
        status: StatusCode,
        value: &T,
    ) -> BoxFuture<'_, io::Result<()>> {
        let body = serde_json::to_vec(value).map_err(io::Error::other);
        Box::pin(async move {
            let body = body?;
            self.respond(status, "application/json", &body).await
        })
    }

    async fn respond(&mut self, status: StatusCode, content_type: &'static str, body: &[u8]) -> io::Result<()> {
        self.writer
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.writer.write_header(status);
        write_all(&mut *self.writer, body).await
    }

    /// Flushes the response.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }

    /// Replaces the writer with one that wraps it.
    ///
    /// The wrapping middleware must call [`pop_writer`](Self::pop_writer)
    /// once the rest of the chain has run.
    pub fn wrap_writer<F>(&mut self, wrap: F)
    where
        F: FnOnce(Box<dyn ResponseWriter>) -> Box<dyn ResponseWriter>,
    {
        let inner = std::mem::replace(&mut self.writer, Box::new(Detached::default()));
        self.writer = wrap(inner);
        self.wrapped += 1;
    }

    /// Finishes the outermost wrapping writer and restores the one it
    /// wrapped. Does nothing when the writer is not wrapped.
    pub async fn pop_writer(&mut self) -> io::Result<()> {
        if self.wrapped == 0 {
            return Ok(());
        }
        let result = self.writer.finish().await;
        if let Some(inner) = self.writer.take_inner() {
            self.writer = inner;
        }
        self.wrapped -= 1;
        result
    }

    /// Finishes every wrapping writer, then the transport writer.
    pub async fn finish(&mut self) -> io::Result<()> {
        while self.wrapped > 0 {
            self.pop_writer().await?;
        }
        if self.writer.is_hijacked() {
            return Ok(());
        }
        self.writer.finish().await
    }

    /// Takes over the connection.
    pub fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        self.writer.hijack()
    }

    // ----- errors --------------------------------------------------------

    /// Records `err`, writes its JSON envelope unless a status was already
    /// committed, and ends the chain.
    pub async fn fail(&mut self, err: MeridianError) {
        let status = err.status_code();
        let path = self.request.path();
        if status.is_server_error() {
            tracing::error!(
                request_id = self.request_id.as_ref().map(RequestId::as_str),
                http.path = path,
                http.status = status.as_u16(),
                error = %err,
                "request failed"
            );
        } else {
            tracing::warn!(
                request_id = self.request_id.as_ref().map(RequestId::as_str),
                http.path = path,
                http.status = status.as_u16(),
                error = %err,
                "request rejected"
            );
        }

        if !self.writer.header_written() {
            let envelope = err.to_envelope(self.request_id.as_ref().map(RequestId::as_str));
            let headers = self.writer.headers_mut();
            match &err {
                MeridianError::Authentication {
                    challenge: Some(challenge),
                    ..
                } => {
                    if let Ok(value) = HeaderValue::from_str(challenge) {
                        headers.insert(WWW_AUTHENTICATE, value);
                    }
                }
                MeridianError::RateLimited {
                    retry_after_seconds: Some(seconds),
                    ..
                } => {
                    headers.insert(RETRY_AFTER, HeaderValue::from(*seconds));
                }
                MeridianError::MethodNotAllowed { allowed, .. } if !allowed.is_empty() => {
                    let list = allowed
                        .iter()
                        .map(http::Method::as_str)
                        .collect::<Vec<_>>()
                        .join(", ");
                    if let Ok(value) = HeaderValue::from_str(&list) {
                        headers.insert(ALLOW, value);
                    }
                }
                _ => {}
            }
            headers.remove(http::header::CONTENT_LENGTH);
            if let Err(write_err) = self.json(status, &envelope).await {
                tracing::debug!(error = %write_err, "failed to write error response");
            }
        }

        self.error = Some(err);
        self.end();
    }

    /// The error recorded by [`fail`](Self::fail).
    #[must_use]
    pub fn error(&self) -> Option<&MeridianError> {
        self.error.as_ref()
    }

    /// Takes the recorded error.
    pub fn take_error(&mut self) -> Option<MeridianError> {
        self.error.take()
    }

    // ----- misc ----------------------------------------------------------

    /// The request id, once assigned.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Assigns the request id.
    pub fn set_request_id(&mut self, id: RequestId) {
        self.request_id = Some(id);
    }

    /// Typed per-request values set by middleware.
    #[must_use]
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable typed per-request values.
    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The request's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// When the context was created.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("params", &self.params)
            .field("chain", &self.chain)
            .field("index", &self.index)
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
