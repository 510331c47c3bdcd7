//! Response cache with single-flight coalescing.
//!
//! At most one request per key computes the response at a time; concurrent
//! requests for the same key wait for it and then replay the stored entry.
//!
//! Expired entries are dropped when their key is looked up again, and in
//! bulk by the task started with [`CacheStore::spawn_reaper`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request header values a stored response was produced for.
pub type VaryValues = Vec<(HeaderName, Option<HeaderValue>)>;

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// When the entry stops being served.
    pub expires_at: Instant,
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Request headers named by the response's `Vary`, with the values of
    /// the request that produced it.
    pub vary: VaryValues,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Whether a request with `headers` may be answered with this entry.
    #[must_use]
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        self.vary
            .iter()
            .all(|(name, value)| headers.get(name) == value.as_ref())
    }
}

/// Result of [`CacheStore::acquire`].
#[derive(Debug)]
pub enum Lookup {
    /// A fresh entry to replay.
    Hit(Arc<CacheEntry>),
    /// The caller computes the response and must hand it to
    /// [`Flight::complete`] (or drop the flight to give up).
    Miss(Flight),
}

/// The right to compute a key. Dropping it wakes waiters, who then retry.
#[derive(Debug)]
pub struct Flight {
    store: CacheStore,
    key: String,
    _done: watch::Sender<()>,
}

impl Flight {
    /// The key being computed.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stores the computed response and releases waiters.
    pub fn complete(self, status: StatusCode, headers: HeaderMap, body: Bytes) {
        self.complete_varying(status, headers, body, Vec::new());
    }

    /// Like [`Flight::complete`] for a response that only applies to
    /// requests carrying the same `vary` header values.
    pub fn complete_varying(self, status: StatusCode, headers: HeaderMap, body: Bytes, vary: VaryValues) {
        let entry = CacheEntry {
            expires_at: Instant::now() + self.store.inner.ttl,
            status,
            headers,
            body,
            vary,
        };
        self.store
            .inner
            .state
            .lock()
            .entries
            .insert(self.key.clone(), Arc::new(entry));
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        self.store.inner.state.lock().inflight.remove(&self.key);
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Arc<CacheEntry>>,
    inflight: HashMap<String, watch::Receiver<()>>,
}

#[derive(Debug)]
struct Inner {
    ttl: Duration,
    state: Mutex<State>,
}

/// Why [`CacheStore::acquire`] returned without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cache wait cancelled")]
pub struct Cancelled;

/// A shared response cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Creates a store whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                ttl,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Returns a fresh entry, or the right to compute one. Waits while
    /// another request computes the same key.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<Lookup, Cancelled> {
        loop {
            let mut waiter = {
                let mut state = self.inner.state.lock();
                let now = Instant::now();
                match state.entries.get(key) {
                    Some(entry) if entry.is_fresh(now) => return Ok(Lookup::Hit(Arc::clone(entry))),
                    Some(_) => {
                        state.entries.remove(key);
                    }
                    None => {}
                }
                match state.inflight.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(());
                        state.inflight.insert(key.to_string(), rx);
                        return Ok(Lookup::Miss(Flight {
                            store: self.clone(),
                            key: key.to_string(),
                            _done: tx,
                        }));
                    }
                }
            };

            tracing::debug!(key, "waiting for in-flight response");
            tokio::select! {
                () = cancel.cancelled() => return Err(Cancelled),
                _ = waiter.changed() => {}
            }
        }
    }

    /// Returns a fresh entry without waiting or claiming.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let state = self.inner.state.lock();
        state
            .entries
            .get(key)
            .filter(|e| e.is_fresh(Instant::now()))
            .cloned()
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.is_fresh(now));
        before - state.entries.len()
    }

    /// Starts a task that purges expired entries every `interval` until
    /// `shutdown` fires.
    pub fn spawn_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    /// Number of stored entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn compute(store: &CacheStore, key: &str, counter: &AtomicUsize) -> Bytes {
        let cancel = CancellationToken::new();
        match store.acquire(key, &cancel).await.unwrap() {
            Lookup::Hit(entry) => entry.body.clone(),
            Lookup::Miss(flight) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let body = Bytes::from(format!("value-{n}"));
                flight.complete(StatusCode::OK, HeaderMap::new(), body.clone());
                body
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_compute_once() {
        let store = CacheStore::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);

        let (a, b, c) = tokio::join!(
            compute(&store, "GET /x", &counter),
            compute(&store, "GET /x", &counter),
            compute(&store, "GET /x", &counter),
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_recomputed() {
        let store = CacheStore::new(Duration::from_secs(1));
        let counter = AtomicUsize::new(0);

        compute(&store, "k", &counter).await;
        compute(&store, "k", &counter).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.peek("k").is_none());
        compute(&store, "k", &counter).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_flight_lets_waiter_compute() {
        let store = CacheStore::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let Lookup::Miss(flight) = store.acquire("k", &cancel).await.unwrap() else {
            panic!("expected miss");
        };
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                matches!(store.acquire("k", &cancel).await, Ok(Lookup::Miss(_)))
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(flight);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let store = CacheStore::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let _flight = store.acquire("k", &cancel).await.unwrap();

        let waiting = CancellationToken::new();
        waiting.cancel();
        assert!(matches!(store.acquire("k", &waiting).await, Err(Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = CacheStore::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        if let Lookup::Miss(flight) = store.acquire("k", &cancel).await.unwrap() {
            flight.complete(StatusCode::OK, HeaderMap::new(), Bytes::new());
        }
        assert_eq!(store.len(), 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_drops_one_off_keys() {
        let store = CacheStore::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        for i in 0..1000 {
            if let Lookup::Miss(flight) = store.acquire(&format!("GET /x?n={i}"), &cancel).await.unwrap() {
                flight.complete(StatusCode::OK, HeaderMap::new(), Bytes::from_static(b"x"));
            }
        }
        assert_eq!(store.len(), 1000);

        let shutdown = CancellationToken::new();
        let reaper = store.spawn_reaper(Duration::from_secs(60), shutdown.clone());
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(store.len(), 0);

        shutdown.cancel();
        reaper.await.unwrap();
    }

    #[test]
    fn test_entry_matches_vary_values() {
        let entry = CacheEntry {
            expires_at: Instant::now(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            vary: vec![(
                http::header::ACCEPT_ENCODING,
                Some(HeaderValue::from_static("gzip")),
            )],
        };
        let mut gzip = HeaderMap::new();
        gzip.insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(entry.matches(&gzip));
        assert!(!entry.matches(&HeaderMap::new()));
    }
}
