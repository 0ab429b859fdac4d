//! Real-clock limiter behavior: refill over wall time, window reset, and
//! store TTL expiry. Assertions only rely on sleeps being *at least* the
//! requested duration, so they hold under scheduler jitter.

use floodgate::{
    Config, Limiter, MemoryStore, MemoryStoreConfig, SlidingWindow, Store, TokenBucket,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn token_bucket_refills_over_wall_time() {
    let limiter =
        TokenBucket::new(Config::new(10, Duration::from_secs(1)), MemoryStore::new()).unwrap();

    for i in 0..10 {
        assert!(limiter.allow("k").unwrap(), "request {} should be allowed", i);
    }
    assert!(!limiter.allow("k").unwrap(), "burst should be exhausted");

    // One token refills every 100ms.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(limiter.allow("k").unwrap(), "a refilled token should be available");
}

#[tokio::test]
async fn sliding_window_resets_after_idle_period() {
    let limiter =
        SlidingWindow::new(Config::new(5, Duration::from_millis(200)), MemoryStore::new())
            .unwrap();

    for _ in 0..5 {
        assert!(limiter.allow("k").unwrap());
    }
    assert!(!limiter.allow("k").unwrap());

    // More than two windows idle: the previous count no longer weighs in.
    tokio::time::sleep(Duration::from_millis(450)).await;
    for i in 0..5 {
        assert!(limiter.allow("k").unwrap(), "request {} after reset should be allowed", i);
    }
}

#[tokio::test]
async fn algorithms_do_not_interfere_on_equal_keys() {
    // Each limiter has its own typed store; the same key names independent
    // budgets.
    let bucket =
        TokenBucket::new(Config::new(1, Duration::from_secs(60)), MemoryStore::new()).unwrap();
    let window =
        SlidingWindow::new(Config::new(1, Duration::from_secs(60)), MemoryStore::new()).unwrap();

    assert!(bucket.allow("k").unwrap());
    assert!(window.allow("k").unwrap());
    assert!(!bucket.allow("k").unwrap());
    assert!(!window.allow("k").unwrap());
}

#[tokio::test]
async fn store_entries_expire_in_real_time() {
    let store: Arc<MemoryStore<u64>> = Arc::new(MemoryStore::with_config(MemoryStoreConfig {
        cleanup_interval: Duration::from_secs(3600),
        ..Default::default()
    }));
    store.set("", "k", 7, Duration::from_millis(50)).unwrap();
    assert_eq!(store.get("", "k"), Some(7));

    tokio::time::sleep(Duration::from_millis(100)).await;
    // The sweep has not run (hour-long interval); expiry is still enforced
    // on read.
    assert_eq!(store.get("", "k"), None);
    store.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_clients_cannot_exceed_the_limit() {
    // The hour-long window makes refill negligible for the duration of the
    // test, so exactly the burst is ever allowed.
    let limiter = Arc::new(
        TokenBucket::new(Config::new(50, Duration::from_secs(3600)), MemoryStore::new())
            .unwrap(),
    );

    let mut handles = vec![];
    for _ in 0..20 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            let mut allowed = 0u64;
            for _ in 0..10 {
                if limiter.allow("shared").unwrap() {
                    allowed += 1;
                }
            }
            allowed
        }));
    }

    let results = futures::future::join_all(handles).await;
    let total: u64 = results.into_iter().map(|r| r.unwrap()).sum();
    assert_eq!(total, 50, "200 concurrent attempts should yield exactly 50 allows");
}

#[tokio::test]
async fn reset_applies_through_the_trait_object() {
    let limiters: Vec<Box<dyn Limiter>> = vec![
        Box::new(
            TokenBucket::new(Config::new(1, Duration::from_secs(60)), MemoryStore::new())
                .unwrap(),
        ),
        Box::new(
            SlidingWindow::new(Config::new(1, Duration::from_secs(60)), MemoryStore::new())
                .unwrap(),
        ),
    ];

    for limiter in &limiters {
        assert!(limiter.allow("k").unwrap());
        assert!(!limiter.allow("k").unwrap());
        limiter.reset("k").unwrap();
        assert!(limiter.allow("k").unwrap(), "reset should restore the budget");
    }
}
