use criterion::{black_box, criterion_group, criterion_main, Criterion};
use floodgate::{
    Config, Limiter, MemoryStore, RateLimitLayer, SlidingWindow, TokenBucket,
};

use axum::body::Body;
use http::{Request, Response};
use std::convert::Infallible;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};

// High rate so the benches measure the allow hot path, not denials.
fn bench_config() -> Config {
    Config::new(1_000_000, Duration::from_secs(1))
}

fn token_bucket_allow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter =
        rt.block_on(async { TokenBucket::new(bench_config(), MemoryStore::new()).unwrap() });

    c.bench_function("token_bucket_allow", |b| {
        b.iter(|| {
            let _ = black_box(limiter.allow(black_box("bench-key")));
        });
    });
}

fn sliding_window_allow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter =
        rt.block_on(async { SlidingWindow::new(bench_config(), MemoryStore::new()).unwrap() });

    c.bench_function("sliding_window_allow", |b| {
        b.iter(|| {
            let _ = black_box(limiter.allow(black_box("bench-key")));
        });
    });
}

fn token_bucket_allow_many_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let limiter =
        rt.block_on(async { TokenBucket::new(bench_config(), MemoryStore::new()).unwrap() });
    let keys: Vec<String> = (0..1024).map(|i| format!("client-{}", i)).collect();

    c.bench_function("token_bucket_allow_1024_keys", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) & 1023;
            let _ = black_box(limiter.allow(black_box(&keys[i])));
        });
    });
}

fn middleware_allow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = rt.block_on(async {
        let limiter = TokenBucket::new(bench_config(), MemoryStore::new()).unwrap();
        RateLimitLayer::new(limiter).layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }))
    });

    c.bench_function("middleware_allow", |b| {
        b.to_async(&rt).iter(|| {
            let svc = svc.clone();
            async move {
                let req = Request::builder().uri("/bench").body(Body::empty()).unwrap();
                let _ = black_box(svc.oneshot(req).await);
            }
        });
    });
}

criterion_group!(
    benches,
    token_bucket_allow,
    sliding_window_allow,
    token_bucket_allow_many_keys,
    middleware_allow
);
criterion_main!(benches);
