//! Smooth permit limiter shared by every worker of one engine.
//!
//! Permits are handed out at evenly spaced instants `1 / rate` seconds apart.
//! The first permit after an idle period is free; each acquisition reserves
//! the next slot and then sleeps until its own slot arrives, so callers never
//! hold the lock while waiting.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use herald_core::Clock;
use tracing::{debug, warn};

/// Slowest accepted rate, one permit every 1000 seconds. Lower positive rates
/// are raised to it.
pub const MIN_RATE: f64 = 0.001;

/// Upper bound on the span a single acquisition may reserve.
const MAX_RESERVATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Shared throughput gate.
#[derive(Debug)]
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    rate: f64,
    interval: Duration,
    next_free: Option<Instant>,
}

impl RateLimiter {
    /// Creates a limiter issuing `rate` permits per second.
    ///
    /// A non-positive or non-finite rate is replaced with one permit per
    /// second; a positive rate below [`MIN_RATE`] is raised to it.
    pub fn new(rate: f64, clock: Arc<dyn Clock>) -> Self {
        let rate = sanitize(rate).unwrap_or(1.0);
        Self {
            clock,
            state: Mutex::new(LimiterState { rate, interval: interval_for(rate), next_free: None }),
        }
    }

    /// Current permits per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).rate
    }

    /// Changes the rate. Invalid rates are ignored.
    ///
    /// Permits already reserved keep their slot; the new spacing applies from
    /// the next reservation on.
    pub fn set_rate(&self, rate: f64) {
        let Some(rate) = sanitize(rate) else {
            warn!(rate, "ignoring invalid rate");
            return;
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if (state.rate - rate).abs() > f64::EPSILON {
            debug!(from = state.rate, to = rate, "rate limiter updated");
            state.rate = rate;
            state.interval = interval_for(rate);
        }
    }

    /// Waits until `permits` permits are available. There is no timeout.
    pub async fn acquire(&self, permits: u32) {
        if permits == 0 {
            return;
        }

        let wait = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = self.clock.now();
            let slot = state.next_free.map_or(now, |next| next.max(now));
            let span = state.interval.saturating_mul(permits).min(MAX_RESERVATION);
            state.next_free = Some(slot.checked_add(span).unwrap_or(slot));
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            self.clock.sleep(wait).await;
        }
    }
}

fn sanitize(rate: f64) -> Option<f64> {
    (rate.is_finite() && rate > 0.0).then(|| rate.max(MIN_RATE))
}

fn interval_for(rate: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;

    #[tokio::test]
    async fn vanishing_rate_is_raised_to_the_floor() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(1e-300, clock.clone());
        assert!((limiter.rate() - MIN_RATE).abs() < f64::EPSILON);

        limiter.acquire(1).await;
        limiter.acquire(1).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(1000));

        limiter.set_rate(1e-300);
        assert!((limiter.rate() - MIN_RATE).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn huge_reservations_are_capped() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(MIN_RATE, clock.clone());

        limiter.acquire(u32::MAX).await;
        limiter.acquire(1).await;

        assert_eq!(clock.elapsed(), MAX_RESERVATION);
    }

    #[tokio::test]
    async fn first_permit_is_free() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(1.0, clock.clone());

        limiter.acquire(1).await;

        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn permits_are_spaced_by_rate() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(2.0, clock.clone());

        for _ in 0..10 {
            limiter.acquire(1).await;
        }

        assert_eq!(clock.elapsed(), Duration::from_millis(4500));
    }

    #[tokio::test]
    async fn batch_acquire_reserves_several_slots() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(4.0, clock.clone());

        limiter.acquire(4).await;
        limiter.acquire(1).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rate_change_applies_to_later_permits() {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::new(1.0, clock.clone());

        limiter.acquire(1).await;
        limiter.set_rate(10.0);
        limiter.acquire(1).await;
        limiter.acquire(1).await;

        assert!((limiter.rate() - 10.0).abs() < f64::EPSILON);
        let elapsed = clock.elapsed();
        assert!(elapsed >= Duration::from_millis(1099) && elapsed <= Duration::from_millis(1101));
    }

    #[test]
    fn invalid_rates_are_rejected() {
        let limiter = RateLimiter::new(0.0, Arc::new(TestClock::new()));
        assert!((limiter.rate() - 1.0).abs() < f64::EPSILON);

        limiter.set_rate(f64::NAN);
        limiter.set_rate(-3.0);
        assert!((limiter.rate() - 1.0).abs() < f64::EPSILON);
    }
}
