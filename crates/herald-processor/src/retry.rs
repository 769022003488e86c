//! Fixed-backoff retry decisions for failed jobs.
//!
//! A failed job carries the number of retries it has already consumed. With
//! `max_retries = N` a job gets N retries after its first attempt, so it is
//! attempted N + 1 times in total before it is dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry budget and delay applied to failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries granted after the first attempt.
    pub max_retries: u32,

    /// Delay before a failed job becomes eligible again.
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, backoff: Duration::from_secs(5 * 60) }
    }
}

/// What happens to a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the row and try again later.
    Reschedule {
        /// When the job becomes eligible again
        next_try: DateTime<Utc>,
        /// Retry counter to store
        retries: i32,
    },
    /// Delete the row.
    Drop {
        /// Why the job is given up on
        reason: String,
    },
}

impl RetrySettings {
    /// Creates settings with the given budget and backoff.
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Decides the fate of a job that failed with `retries` already consumed.
    pub fn decide(&self, retries: i32, failed_at: DateTime<Utc>) -> RetryDecision {
        let consumed = u32::try_from(retries.max(0)).unwrap_or(u32::MAX);
        if consumed >= self.max_retries {
            return RetryDecision::Drop {
                reason: format!("retry budget ({}) exhausted", self.max_retries),
            };
        }

        let next_try = chrono::Duration::from_std(self.backoff)
            .ok()
            .and_then(|delay| failed_at.checked_add_signed(delay));
        let Some(next_try) = next_try else {
            return RetryDecision::Drop { reason: "retry backoff out of range".to_string() };
        };

        RetryDecision::Reschedule { next_try, retries: retries.max(0) + 1 }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn counter_progresses_until_budget_is_spent() {
        let settings = RetrySettings::new(3, Duration::from_secs(300));
        let now = Utc::now();

        for retries in 0..3 {
            match settings.decide(retries, now) {
                RetryDecision::Reschedule { next_try, retries: next } => {
                    assert_eq!(next, retries + 1);
                    assert_eq!(next_try - now, chrono::Duration::seconds(300));
                },
                RetryDecision::Drop { reason } => panic!("dropped early: {reason}"),
            }
        }

        assert!(matches!(settings.decide(3, now), RetryDecision::Drop { .. }));
    }

    #[test]
    fn zero_budget_drops_on_first_failure() {
        let settings = RetrySettings::new(0, Duration::ZERO);
        assert!(matches!(settings.decide(0, Utc::now()), RetryDecision::Drop { .. }));
    }

    #[test]
    fn zero_backoff_is_immediately_eligible() {
        let settings = RetrySettings::new(1, Duration::ZERO);
        let now = Utc::now();
        let decision = settings.decide(0, now);
        assert_eq!(decision, RetryDecision::Reschedule { next_try: now, retries: 1 });
    }

    #[test]
    fn backoff_past_the_calendar_drops_the_job() {
        let settings = RetrySettings::new(3, Duration::from_secs(8_640_000_000_000));
        match settings.decide(0, Utc::now()) {
            RetryDecision::Drop { reason } => assert_eq!(reason, "retry backoff out of range"),
            other => panic!("expected drop, got {other:?}"),
        }

        let settings = RetrySettings::new(3, Duration::MAX);
        assert!(matches!(settings.decide(0, Utc::now()), RetryDecision::Drop { .. }));
    }

    proptest! {
        #[test]
        fn attempts_equal_budget_plus_one(max_retries in 0u32..50) {
            let settings = RetrySettings::new(max_retries, Duration::from_secs(1));
            let now = Utc::now();
            let mut retries = 0;
            let mut attempts = 0u32;

            loop {
                attempts += 1;
                match settings.decide(retries, now) {
                    RetryDecision::Reschedule { retries: next, .. } => retries = next,
                    RetryDecision::Drop { .. } => break,
                }
            }

            prop_assert_eq!(attempts, max_retries + 1);
        }
    }
}
