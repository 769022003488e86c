//! Rate limiter on the real clock.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use herald_processor::RateLimiter;
use herald_testing::RealClock;

#[tokio::test]
async fn ten_permits_at_two_per_second_take_four_and_a_half_seconds() {
    let limiter = RateLimiter::new(2.0, Arc::new(RealClock::new()));
    let start = Instant::now();

    for _ in 0..10 {
        limiter.acquire(1).await;
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(4400), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "finished too late: {elapsed:?}");
}

#[tokio::test]
async fn concurrent_callers_share_one_budget() {
    let limiter = Arc::new(RateLimiter::new(20.0, Arc::new(RealClock::new())));
    let start = Instant::now();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.acquire(1).await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // 20 permits at 20/s: the first is free, the other 19 are spaced by 50ms.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "finished too late: {elapsed:?}");
}

#[tokio::test]
async fn raised_rate_applies_to_later_reservations() {
    let limiter = RateLimiter::new(1.0, Arc::new(RealClock::new()));
    limiter.acquire(1).await;
    limiter.set_rate(50.0);

    let start = Instant::now();
    for _ in 0..10 {
        limiter.acquire(1).await;
    }

    // The slot reserved at the old rate is honored once, then 50/s applies.
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(1500), "rate change ignored: {elapsed:?}");
    assert!((limiter.rate() - 50.0).abs() < f64::EPSILON);
}
