use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tollgate::clock::ManualClock;
use tollgate::ratelimit::{Algorithm, RateLimiter};
use tollgate::store::MemoryStore;

const LIMIT: u64 = 10;
const CALLERS: usize = 64;

fn setup() -> (Arc<RateLimiter>, Arc<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    (Arc::new(RateLimiter::with_clock(store.clone(), clock)), store)
}

async fn fire(limiter: &Arc<RateLimiter>, algorithm: Algorithm, identifier: &str) -> usize {
    let handles = (0..CALLERS).map(|_| {
        let limiter = limiter.clone();
        let identifier = identifier.to_string();
        tokio::spawn(async move { limiter.check(&identifier, algorithm, LIMIT, 60).await })
    });

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .filter(|decision| decision.allowed)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_token_bucket_admits_exactly_limit() {
    let (limiter, _) = setup();
    let allowed = fire(&limiter, Algorithm::TokenBucket, "hot").await;
    assert_eq!(allowed, LIMIT as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sliding_window_admits_exactly_limit() {
    let (limiter, store) = setup();
    let allowed = fire(&limiter, Algorithm::SlidingWindow, "hot").await;

    assert_eq!(allowed, LIMIT as usize);
    assert_eq!(store.log_len("sliding_window:hot"), Some(LIMIT as usize));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_contention_on_one_key_leaves_others_alone() {
    let (limiter, _) = setup();

    let (hot, cold) = tokio::join!(
        fire(&limiter, Algorithm::SlidingWindow, "hot"),
        limiter.check("cold", Algorithm::SlidingWindow, LIMIT, 60),
    );

    assert_eq!(hot, LIMIT as usize);
    let cold = cold.unwrap();
    assert!(cold.allowed);
    assert_eq!(cold.remaining, LIMIT - 1);
}
