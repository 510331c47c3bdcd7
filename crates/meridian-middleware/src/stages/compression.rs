//! Compression middleware.
//!
//! Response bodies are compressed with gzip, deflate or brotli according to
//! the client's `Accept-Encoding` header.
//!
//! The wrapping writer buffers up to a byte budget before deciding. The
//! decision is taken on the first write that overflows the budget, on an
//! explicit flush, or when the response finishes. An explicit
//! `write_header` only records the status, so the size of small bodies is
//! still known when the choice is made:
//!
//! - a response that already declares `Content-Encoding`, has a denied
//!   `Content-Type`, is an event stream, or finishes below the minimum size is
//!   passed through verbatim
//! - otherwise `Content-Length` is dropped, `Content-Encoding` is set,
//!   `Accept-Encoding` is appended to `Vary`, and the buffered bytes plus
//!   everything after them stream through the encoder
//!
//! Upgrade requests are never wrapped.
//!
//! ## Example
//!
//! ```
//! use meridian_middleware::stages::{Algorithm, CompressionLevel, CompressionMiddleware};
//!
//! let compression = CompressionMiddleware::builder()
//!     .algorithms([Algorithm::Brotli, Algorithm::Gzip])
//!     .budget(4096)
//!     .level(CompressionLevel::Fast)
//!     .build();
//! ```

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;

use bytes::BytesMut;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression as GzCompression;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, UPGRADE, VARY};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use meridian_core::{
    write_all, BoxFuture, Context, Detached, Handler, HijackError, Hijacked, ResponseWriter,
};

/// Compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Gzip compression (RFC 1952).
    Gzip,
    /// Brotli compression (RFC 7932).
    Brotli,
    /// Deflate compression (RFC 1951).
    Deflate,
    /// Identity (no compression).
    Identity,
}

impl Algorithm {
    /// Returns the HTTP content-encoding value for this algorithm.
    #[must_use]
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Brotli => "br",
            Self::Deflate => "deflate",
            Self::Identity => "identity",
        }
    }

    /// Parses an algorithm from its HTTP encoding name.
    #[must_use]
    pub fn from_encoding(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "br" => Some(Self::Brotli),
            "deflate" => Some(Self::Deflate),
            "identity" => Some(Self::Identity),
            _ => None,
        }
    }
}

/// Compression level setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fastest compression.
    Fast,
    /// Balance of speed and ratio.
    #[default]
    Default,
    /// Best ratio.
    Best,
    /// Explicit level (0-9 for gzip/deflate, 0-11 for brotli).
    Custom(u32),
}

impl CompressionLevel {
    fn to_flate_level(self) -> GzCompression {
        match self {
            Self::Fast => GzCompression::fast(),
            Self::Default => GzCompression::default(),
            Self::Best => GzCompression::best(),
            Self::Custom(level) => GzCompression::new(level.min(9)),
        }
    }

    fn to_brotli_level(self) -> u32 {
        match self {
            Self::Fast => 1,
            Self::Default => 5,
            Self::Best => 11,
            Self::Custom(level) => level.min(11),
        }
    }
}

/// Compression middleware configuration.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    algorithms: Vec<Algorithm>,
    budget: usize,
    min_size: usize,
    level: CompressionLevel,
    deny_types: HashSet<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::Gzip, Algorithm::Deflate, Algorithm::Brotli],
            budget: 4096,
            min_size: 256,
            level: CompressionLevel::Default,
            deny_types: Self::default_deny_types(),
        }
    }
}

impl CompressionConfig {
    /// Content types never compressed: formats that are already compressed.
    #[must_use]
    pub fn default_deny_types() -> HashSet<String> {
        [
            "application/gzip",
            "application/x-gzip",
            "application/zip",
            "application/x-rar-compressed",
            "application/x-7z-compressed",
            "application/x-bzip2",
            "application/pdf",
            "application/wasm",
            "image/jpeg",
            "image/png",
            "image/gif",
            "image/webp",
            "image/avif",
            "audio/mpeg",
            "audio/ogg",
            "video/mp4",
            "video/webm",
            "font/woff2",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
    }

    fn is_denied(&self, content_type: &str) -> bool {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim()
            .to_ascii_lowercase();
        self.deny_types.contains(&base)
    }

    /// Picks the first encoding in client order that the client accepts
    /// (`q` > 0) and the server supports. `identity` or nothing yields `None`.
    #[must_use]
    pub fn negotiate(&self, accept_encoding: &str) -> Option<Algorithm> {
        for (name, quality) in parse_accept_encoding(accept_encoding) {
            if quality <= 0.0 {
                continue;
            }
            if name == "*" {
                let excluded: Vec<Algorithm> = parse_accept_encoding(accept_encoding)
                    .into_iter()
                    .filter(|(_, q)| *q <= 0.0)
                    .filter_map(|(n, _)| Algorithm::from_encoding(&n))
                    .collect();
                return self
                    .algorithms
                    .iter()
                    .copied()
                    .find(|a| *a != Algorithm::Identity && !excluded.contains(a));
            }
            match Algorithm::from_encoding(&name) {
                Some(Algorithm::Identity) => return None,
                Some(algorithm) if self.algorithms.contains(&algorithm) => return Some(algorithm),
                _ => {}
            }
        }
        None
    }
}

fn parse_accept_encoding(header: &str) -> Vec<(String, f32)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let name = pieces.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let quality = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .map_or(1.0, |q| q.clamp(0.0, 1.0));
            Some((name.to_ascii_lowercase(), quality))
        })
        .collect()
}

/// Builder for [`CompressionMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct CompressionBuilder {
    config: CompressionConfig,
}

impl CompressionBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the supported algorithms.
    #[must_use]
    pub fn algorithms(mut self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        self.config.algorithms = algorithms.into_iter().collect();
        self
    }

    /// Bytes buffered before the encoding decision.
    #[must_use]
    pub fn budget(mut self, bytes: usize) -> Self {
        self.config.budget = bytes.max(1);
        self
    }

    /// Responses that finish smaller than this are not compressed.
    #[must_use]
    pub fn min_size(mut self, bytes: usize) -> Self {
        self.config.min_size = bytes;
        self
    }

    /// Sets the compression level.
    #[must_use]
    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.config.level = level;
        self
    }

    /// Adds a content type that is never compressed.
    #[must_use]
    pub fn deny_type(mut self, content_type: impl Into<String>) -> Self {
        self.config
            .deny_types
            .insert(content_type.into().to_ascii_lowercase());
        self
    }

    /// Replaces the denied content types.
    #[must_use]
    pub fn deny_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.deny_types = types
            .into_iter()
            .map(|t| t.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Builds the middleware.
    #[must_use]
    pub fn build(self) -> CompressionMiddleware {
        CompressionMiddleware {
            config: Arc::new(self.config),
        }
    }
}

enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(DeflateEncoder<Vec<u8>>),
    Brotli(Box<brotli::CompressorWriter<Vec<u8>>>),
}

impl Encoder {
    fn new(algorithm: Algorithm, level: CompressionLevel) -> Option<Self> {
        match algorithm {
            Algorithm::Gzip => Some(Self::Gzip(GzEncoder::new(Vec::new(), level.to_flate_level()))),
            Algorithm::Deflate => Some(Self::Deflate(DeflateEncoder::new(
                Vec::new(),
                level.to_flate_level(),
            ))),
            Algorithm::Brotli => Some(Self::Brotli(Box::new(brotli::CompressorWriter::new(
                Vec::new(),
                4096,
                level.to_brotli_level(),
                22,
            )))),
            Algorithm::Identity => None,
        }
    }

    fn output(&mut self) -> Vec<u8> {
        match self {
            Self::Gzip(e) => std::mem::take(e.get_mut()),
            Self::Deflate(e) => std::mem::take(e.get_mut()),
            Self::Brotli(e) => std::mem::take(e.get_mut()),
        }
    }

    /// Feeds `data` and returns the compressed bytes produced so far.
    fn encode(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(e) => e.write_all(data)?,
            Self::Deflate(e) => e.write_all(data)?,
            Self::Brotli(e) => e.write_all(data)?,
        }
        Ok(self.output())
    }

    fn flush(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(e) => e.flush()?,
            Self::Deflate(e) => e.flush()?,
            Self::Brotli(e) => e.flush()?,
        }
        Ok(self.output())
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Self::Gzip(e) => e.finish(),
            Self::Deflate(e) => e.finish(),
            Self::Brotli(e) => Ok(e.into_inner()),
        }
    }
}

enum Mode {
    Pending,
    Passthrough,
    Encoding(Encoder),
}

struct CompressWriter {
    inner: Box<dyn ResponseWriter>,
    config: Arc<CompressionConfig>,
    algorithm: Algorithm,
    head: bool,
    buffer: BytesMut,
    status: Option<StatusCode>,
    mode: Mode,
}

impl CompressWriter {
    fn passthrough_reason(&self, finishing: bool) -> Option<&'static str> {
        let headers = self.inner.headers();
        let status = self.status.unwrap_or_else(|| self.inner.status());
        if headers.contains_key(CONTENT_ENCODING) {
            return Some("already encoded");
        }
        if self.head || status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return Some("no body");
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.starts_with("text/event-stream") {
            return Some("event stream");
        }
        if self.config.is_denied(content_type) {
            return Some("denied content type");
        }
        if finishing && self.buffer.len() < self.config.min_size {
            return Some("below minimum size");
        }
        None
    }

    async fn decide(&mut self, finishing: bool) -> io::Result<()> {
        if !matches!(self.mode, Mode::Pending) {
            return Ok(());
        }
        let encoder = match self.passthrough_reason(finishing) {
            Some(reason) => {
                tracing::trace!(reason, "compression skipped");
                None
            }
            None => Encoder::new(self.algorithm, self.config.level),
        };
        if encoder.is_some() {
            let headers = self.inner.headers_mut();
            headers.remove(CONTENT_LENGTH);
            headers.insert(
                CONTENT_ENCODING,
                HeaderValue::from_static(self.algorithm.encoding_name()),
            );
            append_vary(headers);
        }
        if let Some(status) = self.status {
            self.inner.write_header(status);
        }

        let buffered = self.buffer.split().freeze();
        match encoder {
            Some(mut encoder) => {
                let out = encoder.encode(&buffered)?;
                self.mode = Mode::Encoding(encoder);
                write_all(&mut *self.inner, &out).await
            }
            None => {
                self.mode = Mode::Passthrough;
                write_all(&mut *self.inner, &buffered).await
            }
        }
    }
}

fn append_vary(headers: &mut HeaderMap) {
    let present = headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("accept-encoding"));
    if !present {
        headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
    }
}

impl ResponseWriter for CompressWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.inner.status())
    }

    fn write_header(&mut self, status: StatusCode) {
        if matches!(self.mode, Mode::Pending) {
            if self.status.is_none() {
                self.status = Some(status);
            }
        } else {
            self.inner.write_header(status);
        }
    }

    fn header_written(&self) -> bool {
        self.status.is_some() || self.inner.header_written()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            if matches!(self.mode, Mode::Pending) {
                if self.status.is_none() {
                    self.status = Some(self.inner.status());
                }
                if self.buffer.len() + data.len() <= self.config.budget {
                    self.buffer.extend_from_slice(data);
                    return Ok(data.len());
                }
                self.decide(false).await?;
            }
            match &mut self.mode {
                Mode::Encoding(encoder) => {
                    let out = encoder.encode(data)?;
                    write_all(&mut *self.inner, &out).await?;
                    Ok(data.len())
                }
                _ => self.inner.write(data).await,
            }
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.decide(false).await?;
            if let Mode::Encoding(encoder) = &mut self.mode {
                let out = encoder.flush()?;
                write_all(&mut *self.inner, &out).await?;
            }
            self.inner.flush().await
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            self.decide(true).await?;
            if let Mode::Encoding(encoder) = std::mem::replace(&mut self.mode, Mode::Passthrough) {
                let out = encoder.finish()?;
                write_all(&mut *self.inner, &out).await?;
            }
            Ok(())
        })
    }

    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        self.mode = Mode::Passthrough;
        self.inner.hijack()
    }

    fn is_hijacked(&self) -> bool {
        self.inner.is_hijacked()
    }

    fn take_inner(&mut self) -> Option<Box<dyn ResponseWriter>> {
        Some(std::mem::replace(&mut self.inner, Box::new(Detached::default())))
    }
}

/// Compression middleware.
///
/// # Headers
///
/// - Reads: `Accept-Encoding`, `Upgrade` from the request
/// - Writes: `Content-Encoding`, `Vary` to the response
/// - Removes: `Content-Length` when compressing
#[derive(Debug, Clone, Default)]
pub struct CompressionMiddleware {
    config: Arc<CompressionConfig>,
}

impl CompressionMiddleware {
    /// Creates a compression middleware with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> CompressionBuilder {
        CompressionBuilder::new()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Handler for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if ctx.request().headers().contains_key(UPGRADE) {
                return;
            }
            let Some(algorithm) = ctx
                .request()
                .header(ACCEPT_ENCODING)
                .and_then(|ae| self.config.negotiate(ae))
            else {
                return;
            };

            let config = Arc::clone(&self.config);
            let head = ctx.request().method() == Method::HEAD;
            ctx.wrap_writer(move |inner| {
                Box::new(CompressWriter {
                    inner,
                    config,
                    algorithm,
                    head,
                    buffer: BytesMut::new(),
                    status: None,
                    mode: Mode::Pending,
                })
            });
            ctx.next().await;
            if let Err(err) = ctx.pop_writer().await {
                tracing::debug!(error = %err, "compressed response not completed");
            }
        })
    }
}
