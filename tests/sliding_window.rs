use std::sync::Arc;
use std::time::Duration;

use tollgate::clock::ManualClock;
use tollgate::ratelimit::{Quota, SlidingWindowLimiter};
use tollgate::store::MemoryStore;

struct Harness {
    limiter: SlidingWindowLimiter,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn setup() -> Harness {
    let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    Harness {
        limiter: SlidingWindowLimiter::new(store.clone(), clock.clone()),
        store,
        clock,
    }
}

fn quota(limit: u64, window_seconds: u64) -> Quota {
    Quota::new(limit, window_seconds).unwrap()
}

#[tokio::test]
async fn test_limit_three_example() {
    let h = setup();
    let q = quota(3, 60);

    for expected in [2, 1, 0] {
        let decision = h.limiter.check("user", &q).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected);
        h.clock.advance(Duration::from_millis(100));
    }

    let decision = h.limiter.check("user", &q).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, 0);
    let retry = decision.retry_after.unwrap();
    assert!(retry > 0.0 && retry <= 60.0);
}

#[tokio::test]
async fn test_allowed_again_after_full_window() {
    let h = setup();
    let q = quota(2, 10);

    h.limiter.check("user", &q).await.unwrap();
    h.limiter.check("user", &q).await.unwrap();
    assert!(!h.limiter.check("user", &q).await.unwrap().allowed);

    h.clock.advance(Duration::from_secs(10));
    let decision = h.limiter.check("user", &q).await.unwrap();
    assert!(decision.allowed);
}

#[tokio::test]
async fn test_window_slides_one_entry_at_a_time() {
    let h = setup();
    let q = quota(2, 10);

    h.limiter.check("user", &q).await.unwrap();
    h.clock.advance(Duration::from_secs(4));
    h.limiter.check("user", &q).await.unwrap();

    // First entry leaves at +10s, second at +14s.
    h.clock.advance(Duration::from_secs(6));
    assert!(h.limiter.check("user", &q).await.unwrap().allowed);
    let denied = h.limiter.check("user", &q).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(4.0));
}

#[tokio::test]
async fn test_denied_requests_are_not_logged() {
    let h = setup();
    let q = quota(3, 60);

    for _ in 0..20 {
        h.limiter.check("user", &q).await.unwrap();
    }
    assert_eq!(h.store.log_len("sliding_window:user"), Some(3));
}

#[tokio::test]
async fn test_status_is_read_only() {
    let h = setup();
    let q = quota(2, 60);

    h.limiter.check("user", &q).await.unwrap();
    for _ in 0..5 {
        let usage = h.limiter.status("user", &q).await.unwrap();
        assert_eq!(usage.used, 1);
        assert_eq!(usage.remaining, 1);
        assert_eq!(usage.reset_in_seconds, 60.0);
    }

    let decision = h.limiter.check("user", &q).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 0);
}

#[tokio::test]
async fn test_status_of_unknown_identifier() {
    let h = setup();
    let usage = h.limiter.status("nobody", &quota(5, 30)).await.unwrap();

    assert_eq!(usage.used, 0);
    assert_eq!(usage.remaining, 5);
    assert_eq!(usage.reset_in_seconds, 30.0);
    assert_eq!(h.store.key_count(), 0);
}

#[tokio::test]
async fn test_reset_behaves_like_new_identifier() {
    let h = setup();
    let q = quota(4, 60);

    for _ in 0..5 {
        h.limiter.check("user", &q).await.unwrap();
    }
    assert!(h.limiter.reset("user").await.unwrap());
    assert!(!h.limiter.reset("user").await.unwrap());

    let decision = h.limiter.check("user", &q).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 3);
}

#[tokio::test]
async fn test_identifiers_are_independent() {
    let h = setup();
    let q = quota(1, 60);

    h.limiter.check("user_a", &q).await.unwrap();
    assert!(!h.limiter.check("user_a", &q).await.unwrap().allowed);
    assert!(h.limiter.check("user_b", &q).await.unwrap().allowed);
}

#[tokio::test]
async fn test_ttl_refreshed_to_twice_the_window() {
    let h = setup();
    let q = quota(5, 45);

    h.limiter.check("user", &q).await.unwrap();
    h.clock.advance(Duration::from_secs(30));
    h.limiter.check("user", &q).await.unwrap();

    assert_eq!(h.store.ttl("sliding_window:user"), Some(90.0));
}
