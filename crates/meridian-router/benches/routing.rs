//! Routing benchmarks.
//!
//! Run with: `cargo bench -p meridian-router`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http::Method;
use meridian_router::{Delimiters, MatchTree, Router};

fn build_router(num_routes: usize) -> Router<usize> {
    let mut router = Router::new();

    for i in 0..num_routes / 3 {
        router
            .add(&Method::GET, &format!("/api/v1/resource{i}"), i)
            .unwrap();
    }

    for i in 0..num_routes / 3 {
        router
            .add(&Method::GET, &format!("/api/v1/resource{i}/:id<isnum>"), i)
            .unwrap();
    }

    for i in 0..num_routes / 3 {
        router
            .add(&Method::GET, &format!("/api/v1/org/:org/resource{i}/:id"), i)
            .unwrap();
    }

    router.any("/static/*path", usize::MAX).unwrap();
    router
}

fn bench_static_match(c: &mut Criterion) {
    let router = build_router(100);

    c.bench_function("static_match", |b| {
        b.iter(|| black_box(router.lookup(&Method::GET, "/api/v1/resource30")));
    });
}

fn bench_param_match(c: &mut Criterion) {
    let router = build_router(100);

    c.bench_function("validated_param_match", |b| {
        b.iter(|| black_box(router.lookup(&Method::GET, "/api/v1/resource25/12345")));
    });
}

fn bench_nested_param_match(c: &mut Criterion) {
    let router = build_router(100);

    c.bench_function("nested_param_match", |b| {
        b.iter(|| {
            black_box(router.lookup(&Method::GET, "/api/v1/org/acme-corp/resource10/12345"))
        });
    });
}

fn bench_wildcard_match(c: &mut Criterion) {
    let router = build_router(100);

    c.bench_function("wildcard_match", |b| {
        b.iter(|| black_box(router.lookup(&Method::GET, "/static/css/site/main.css")));
    });
}

fn bench_miss(c: &mut Criterion) {
    let router = build_router(100);

    c.bench_function("method_not_allowed", |b| {
        b.iter(|| black_box(router.lookup(&Method::POST, "/api/v1/resource5")));
    });
}

fn bench_match_tree(c: &mut Criterion) {
    let mut hosts = MatchTree::new(Delimiters::Host);
    for i in 0..50 {
        hosts
            .insert(&format!("https://*.tenant{i}.example.com"), i)
            .unwrap();
    }

    c.bench_function("match_tree_host", |b| {
        b.iter(|| black_box(hosts.find("https://api.tenant42.example.com")));
    });
}

fn bench_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaling");

    for num_routes in [10, 50, 100, 500, 1000] {
        let router = build_router(num_routes);

        group.bench_with_input(
            BenchmarkId::new("static_match", num_routes),
            &num_routes,
            |b, &n| {
                let path = format!("/api/v1/resource{}", n / 6);
                b.iter(|| black_box(router.lookup(&Method::GET, &path)));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("param_match", num_routes),
            &num_routes,
            |b, &n| {
                let path = format!("/api/v1/resource{}/12345", n / 6);
                b.iter(|| black_box(router.lookup(&Method::GET, &path)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_static_match,
    bench_param_match,
    bench_nested_param_match,
    bench_wildcard_match,
    bench_miss,
    bench_match_tree,
    bench_scaling
);
criterion_main!(benches);
