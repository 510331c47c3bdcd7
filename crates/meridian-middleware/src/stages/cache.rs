//! Response caching middleware.
//!
//! Idempotent requests (GET and HEAD unless configured otherwise) are keyed
//! by a fingerprint, `METHOD URI` by default. A fresh entry is replayed
//! without running the handler. On a miss this request becomes the only one
//! computing the key: a capturing writer tees the response to the client and
//! into a buffer, and the capture is stored once the handler returns.
//! Concurrent requests for the same key wait and then replay.
//!
//! Responses are not stored when the status is 500 or above, the handler
//! flushed (streamed) the body, the body exceeds the size limit, the
//! response carries `Cache-Control: no-store` or `private`, or it says
//! `Vary: *`.
//!
//! A stored response that names request headers in `Vary` keeps the values
//! it was produced for. A later request with different values is served by
//! the handler and not stored, so a compressed body is never replayed to a
//! client that did not ask for it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, CACHE_CONTROL, VARY};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use meridian_core::{
    write_all, BoxFuture, Context, Detached, Handler, MeridianError, ResponseWriter,
};
use parking_lot::Mutex;

use crate::cache::{CacheEntry, CacheStore, Lookup, VaryValues};

/// Header reporting whether the response came from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Computes the cache key of a request.
pub type Fingerprint = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// The default fingerprint: method and request URI.
#[must_use]
pub fn method_and_uri(ctx: &Context) -> String {
    format!("{} {}", ctx.request().method(), ctx.request().uri())
}

#[derive(Debug, Default)]
struct Captured {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    streamed: bool,
    oversized: bool,
}

/// Writes through to the wrapped writer while keeping a copy.
struct CaptureWriter {
    inner: Box<dyn ResponseWriter>,
    captured: Arc<Mutex<Captured>>,
    max_body: usize,
}

impl CaptureWriter {
    fn commit(&mut self) {
        let mut captured = self.captured.lock();
        if captured.status.is_none() {
            captured.status = Some(self.inner.status());
            captured.headers = self.inner.headers().clone();
        }
    }
}

impl ResponseWriter for CaptureWriter {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.inner.write_header(status);
        self.commit();
    }

    fn header_written(&self) -> bool {
        self.inner.header_written()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            let n = self.inner.write(data).await?;
            self.commit();
            let mut captured = self.captured.lock();
            if captured.body.len() + n > self.max_body {
                captured.oversized = true;
            } else if !captured.oversized {
                captured.body.extend_from_slice(&data[..n]);
            }
            Ok(n)
        })
    }

    fn flush(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.captured.lock().streamed = true;
        self.inner.flush()
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn hijack(&mut self) -> Result<meridian_core::Hijacked, meridian_core::HijackError> {
        self.captured.lock().streamed = true;
        self.inner.hijack()
    }

    fn is_hijacked(&self) -> bool {
        self.inner.is_hijacked()
    }

    fn take_inner(&mut self) -> Option<Box<dyn ResponseWriter>> {
        Some(std::mem::replace(&mut self.inner, Box::new(Detached::default())))
    }
}

/// Single-flight response cache middleware.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use meridian_middleware::cache::CacheStore;
/// use meridian_middleware::stages::CacheMiddleware;
///
/// let cache = CacheMiddleware::new(CacheStore::new(Duration::from_secs(30)))
///     .max_body_bytes(64 * 1024);
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    store: CacheStore,
    methods: Vec<Method>,
    fingerprint: Fingerprint,
    max_body: usize,
}

impl std::fmt::Debug for CacheMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMiddleware")
            .field("store", &self.store)
            .field("methods", &self.methods)
            .field("max_body", &self.max_body)
            .finish_non_exhaustive()
    }
}

impl CacheMiddleware {
    /// Creates a middleware caching GET and HEAD into `store`.
    #[must_use]
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            methods: vec![Method::GET, Method::HEAD],
            fingerprint: Arc::new(method_and_uri),
            max_body: 1024 * 1024,
        }
    }

    /// Replaces the cacheable methods.
    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    /// Replaces the fingerprint function.
    #[must_use]
    pub fn fingerprint<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.fingerprint = Arc::new(f);
        self
    }

    /// Largest body that is stored.
    #[must_use]
    pub fn max_body_bytes(mut self, max: usize) -> Self {
        self.max_body = max;
        self
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    async fn replay(ctx: &mut Context, entry: &CacheEntry) {
        metrics::counter!("meridian_cache_hits_total").increment(1);
        let headers = ctx.writer().headers_mut();
        for (name, value) in &entry.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        ctx.write_header(entry.status);
        if ctx.request().method() != Method::HEAD {
            if let Err(err) = write_all(ctx.writer(), &entry.body).await {
                tracing::debug!(error = %err, "failed to replay cached response");
            }
        }
        ctx.end();
    }
}

/// Headers that describe one exchange and are never replayed.
const PER_REQUEST_HEADERS: &[&str] = &["set-cookie", "x-request-id", CACHE_STATUS_HEADER];

fn storable(captured: &Captured) -> Option<StatusCode> {
    let status = captured.status?;
    if status.is_server_error() || captured.streamed || captured.oversized {
        return None;
    }
    let no_store = captured
        .headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|d| matches!(d.trim(), "no-store" | "private"));
    (!no_store).then_some(status)
}

/// The request header values named by the response's `Vary`, or `None` for
/// `Vary: *`.
fn vary_values(response: &HeaderMap, request: &HeaderMap) -> Option<VaryValues> {
    let mut values = VaryValues::new();
    let names = response
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty());
    for name in names {
        if name == "*" {
            return None;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            return None;
        };
        if values.iter().all(|(seen, _)| *seen != name) {
            let value = request.get(&name).cloned();
            values.push((name, value));
        }
    }
    Some(values)
}

impl Handler for CacheMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn call<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.methods.contains(ctx.request().method()) {
                return;
            }
            let key = (self.fingerprint)(ctx);
            let cancel = ctx.cancellation().clone();
            let flight = match self.store.acquire(&key, &cancel).await {
                Ok(Lookup::Hit(entry)) if entry.matches(ctx.request().headers()) => {
                    Self::replay(ctx, &entry).await;
                    return;
                }
                Ok(Lookup::Hit(_)) => {
                    tracing::trace!(key = %key, "stored variant does not match request");
                    metrics::counter!("meridian_cache_misses_total").increment(1);
                    ctx.writer()
                        .headers_mut()
                        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
                    return;
                }
                Ok(Lookup::Miss(flight)) => flight,
                Err(_) => {
                    ctx.fail(MeridianError::unavailable("request cancelled while waiting for cache"))
                        .await;
                    return;
                }
            };

            metrics::counter!("meridian_cache_misses_total").increment(1);
            ctx.writer()
                .headers_mut()
                .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));

            let captured = Arc::new(Mutex::new(Captured::default()));
            let max_body = self.max_body;
            let capture = Arc::clone(&captured);
            ctx.wrap_writer(move |inner| {
                Box::new(CaptureWriter {
                    inner,
                    captured: capture,
                    max_body,
                })
            });
            ctx.next().await;
            if let Err(err) = ctx.pop_writer().await {
                tracing::debug!(error = %err, "cache writer finish failed");
            }

            let captured = std::mem::take(&mut *captured.lock());
            let vary = vary_values(&captured.headers, ctx.request().headers());
            match (storable(&captured), vary) {
                (Some(status), Some(vary)) => {
                    tracing::debug!(key = %flight.key(), status = status.as_u16(), "caching response");
                    let mut headers = captured.headers;
                    for name in PER_REQUEST_HEADERS {
                        headers.remove(*name);
                    }
                    flight.complete_varying(status, headers, Bytes::from(captured.body), vary);
                }
                _ => drop(flight),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{get, request, respond, run};
    use meridian_core::named_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn middleware() -> CacheMiddleware {
        CacheMiddleware::new(CacheStore::new(Duration::from_secs(60)))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Handler {
        let counter = Arc::clone(counter);
        named_fn("counting", move |ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = ctx.text(StatusCode::OK, &format!("value {n}")).await;
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_compute_once() {
        let cache = middleware();
        let counter = Arc::new(AtomicUsize::new(0));

        let ((_, first), (_, second)) = tokio::join!(
            run(cache.clone(), counting(&counter), get("/x")),
            run(cache.clone(), counting(&counter), get("/x")),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(first.text(), "value 1");
        assert_eq!(second.text(), "value 1");
        assert_eq!(second.header(CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let cache = CacheMiddleware::new(CacheStore::new(Duration::from_secs(1)));
        let counter = Arc::new(AtomicUsize::new(0));
        run(cache.clone(), counting(&counter), get("/x")).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let (_, recording) = run(cache.clone(), counting(&counter), get("/x")).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(recording.text(), "value 2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_not_stored() {
        let cache = middleware();
        run(
            cache.clone(),
            respond(StatusCode::SERVICE_UNAVAILABLE, "busy"),
            get("/x"),
        )
        .await;
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_response_not_stored() {
        let cache = middleware();
        let streaming = named_fn("streaming", |ctx| {
            Box::pin(async move {
                let _ = ctx.write(b"part").await;
                let _ = ctx.flush().await;
            })
        });
        let (_, recording) = run(cache.clone(), streaming, get("/x")).await;
        assert_eq!(recording.text(), "part");
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_bypasses_cache() {
        let cache = middleware();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            run(cache.clone(), counting(&counter), request(Method::POST, "/x")).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_store_respected() {
        let cache = middleware();
        let private = named_fn("private", |ctx| {
            Box::pin(async move {
                ctx.writer()
                    .headers_mut()
                    .insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=60"));
                let _ = ctx.text(StatusCode::OK, "mine").await;
            })
        });
        run(cache.clone(), private, get("/me")).await;
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vary_star_not_stored() {
        let cache = middleware();
        let varying = named_fn("varying", |ctx| {
            Box::pin(async move {
                ctx.writer().headers_mut().insert(VARY, HeaderValue::from_static("*"));
                let _ = ctx.text(StatusCode::OK, "depends").await;
            })
        });
        run(cache.clone(), varying, get("/x")).await;
        assert!(cache.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_variant_replayed_only_to_matching_request() {
        let cache = middleware();
        let counter = Arc::new(AtomicUsize::new(0));
        let by_language = |counter: &Arc<AtomicUsize>| {
            let counter = Arc::clone(counter);
            named_fn("by_language", move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    let body = ctx.request().header("accept-language").unwrap_or("en").to_string();
                    ctx.writer()
                        .headers_mut()
                        .insert(VARY, HeaderValue::from_static("Accept-Language"));
                    let _ = ctx.text(StatusCode::OK, &body).await;
                })
            })
        };

        let french = || get("/greeting").with_header("accept-language", "fr");
        run(cache.clone(), by_language(&counter), french()).await;
        let (_, hit) = run(cache.clone(), by_language(&counter), french()).await;
        assert_eq!(hit.text(), "fr");
        assert_eq!(hit.header(CACHE_STATUS_HEADER).as_deref(), Some("HIT"));

        let (_, other) = run(cache.clone(), by_language(&counter), get("/greeting")).await;
        assert_eq!(other.text(), "en");
        assert_eq!(other.header(CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_keeps_headers() {
        let cache = middleware();
        let counter = Arc::new(AtomicUsize::new(0));
        run(cache.clone(), counting(&counter), get("/x")).await;
        let (_, recording) = run(cache.clone(), counting(&counter), get("/x")).await;

        assert_eq!(
            recording.header("content-type").as_deref(),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(recording.header(CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
    }
}
