//! End-to-end tests running several stages in one chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode, Uri};
use meridian_core::{named_fn, Chain, Context, Handler, Recording, Request};
use meridian_middleware::stages::{
    BasicAuth, BreakerMiddleware, CacheMiddleware, CompressionMiddleware, IpFilter, ListKind,
    RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware, CACHE_STATUS_HEADER,
    REQUEST_ID_HEADER,
};
use meridian_middleware::{BreakerConfig, BreakerState, BreakerStore, CacheStore};

fn get(uri: &str) -> Request {
    Request::new(Method::GET, uri.parse::<Uri>().unwrap())
}

async fn send(chain: &Chain, req: Request) -> Recording {
    let (mut ctx, recording) = Context::recorded(req);
    ctx.run(chain.clone()).await;
    ctx.finish().await.unwrap();
    recording
}

/// Counts calls and answers with the count, or 500 when `fail` is set.
fn counting(calls: Arc<AtomicUsize>, fail: bool) -> impl Handler {
    named_fn("counting", move |ctx| {
        let calls = calls.clone();
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let status = if fail { StatusCode::INTERNAL_SERVER_ERROR } else { StatusCode::OK };
            let _ = ctx.text(status, &format!("value {n}")).await;
        })
    })
}

struct Stack {
    breakers: BreakerStore,
    cache: CacheStore,
}

impl Stack {
    fn new() -> Self {
        let config = BreakerConfig {
            max_failures: 3,
            open_wait: Duration::from_secs(30),
            ..BreakerConfig::default()
        };
        Self {
            breakers: BreakerStore::new(config),
            cache: CacheStore::new(Duration::from_secs(60)),
        }
    }

    fn chain(&self, handler: impl Handler) -> Chain {
        Chain::from(RecoveryMiddleware::new())
            .with(RequestIdMiddleware::new())
            .with(RateLimitMiddleware::builder().global().speed(1000.0).burst(1000).build())
            .with(BreakerMiddleware::new(self.breakers.clone()))
            .with(CacheMiddleware::new(self.cache.clone()))
            .with(CompressionMiddleware::new())
            .with(handler)
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_computed_once() {
    let stack = Stack::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = stack.chain(counting(calls.clone(), false));

    let (a, b) = tokio::join!(send(&chain, get("/x")), send(&chain, get("/x")));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);
    assert_eq!(a.text(), "value 1");
    assert_eq!(b.text(), "value 1");

    let mut cache_status = [
        a.header(CACHE_STATUS_HEADER).unwrap(),
        b.header(CACHE_STATUS_HEADER).unwrap(),
    ];
    cache_status.sort();
    assert_eq!(cache_status, ["HIT".to_string(), "MISS".to_string()]);
    assert_ne!(a.header(REQUEST_ID_HEADER), b.header(REQUEST_ID_HEADER));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_failures() {
    let stack = Stack::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = stack.chain(counting(calls.clone(), true));

    for _ in 0..4 {
        let recording = send(&chain, get("/flaky")).await;
        assert_eq!(recording.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let recording = send(&chain, get("/flaky")).await;

    assert_eq!(recording.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        stack.breakers.get("/flaky").unwrap().state(),
        BreakerState::Open
    );
    let body: serde_json::Value = serde_json::from_slice(&recording.body()).unwrap();
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    assert!(recording.header(REQUEST_ID_HEADER).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_burst_then_refill() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = Chain::from(RequestIdMiddleware::new())
        .with(RateLimitMiddleware::builder().global().speed(1.0).burst(3).build())
        .with(counting(calls.clone(), false));

    let mut statuses = Vec::new();
    for _ in 0..5 {
        statuses.push(send(&chain, get("/")).await.status());
    }
    let admitted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let rejected = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!((admitted, rejected), (3, 2));

    tokio::time::advance(Duration::from_millis(1100)).await;
    assert_eq!(send(&chain, get("/")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rejections_share_error_envelope() {
    let filter = IpFilter::new();
    filter.add(ListKind::Deny, "203.0.113.0/24".parse().unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = Chain::from(RequestIdMiddleware::new())
        .with(filter)
        .with(BasicAuth::new("admin").user("root", "hunter2"))
        .with(counting(calls.clone(), false));

    let blocked = send(&chain, get("/").with_header("x-forwarded-for", "203.0.113.7")).await;
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    let anonymous = send(&chain, get("/")).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    assert!(anonymous.header("www-authenticate").unwrap().starts_with("Basic"));

    for recording in [&blocked, &anonymous] {
        let body: serde_json::Value = serde_json::from_slice(&recording.body()).unwrap();
        assert_eq!(
            body["request_id"].as_str(),
            recording.header(REQUEST_ID_HEADER).as_deref()
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_compressed_response_not_replayed_without_accept_encoding() {
    let stack = Stack::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let text = "cache then compress ".repeat(100);
    let page = {
        let calls = calls.clone();
        let text = text.clone();
        named_fn("page", move |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            let text = text.clone();
            Box::pin(async move {
                let _ = ctx.text(StatusCode::OK, &text).await;
            })
        })
    };
    let chain = stack.chain(page);

    let gzip = send(&chain, get("/page").with_header("accept-encoding", "gzip")).await;
    assert_eq!(gzip.header("content-encoding").as_deref(), Some("gzip"));

    let plain = send(&chain, get("/page")).await;
    assert_eq!(plain.status(), StatusCode::OK);
    assert!(plain.header("content-encoding").is_none());
    assert_eq!(plain.header(CACHE_STATUS_HEADER).as_deref(), Some("MISS"));
    assert_eq!(plain.text(), text);

    let again = send(&chain, get("/page").with_header("accept-encoding", "gzip")).await;
    assert_eq!(again.header(CACHE_STATUS_HEADER).as_deref(), Some("HIT"));
    assert_eq!(again.header("content-encoding").as_deref(), Some("gzip"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
