//! Runtime policy of one processor namespace.
//!
//! Every engine reads its knobs from the shared [`ConfigStore`] under a
//! namespace prefix such as `user.processor.email`:
//!
//! | key | meaning | default |
//! |---|---|---|
//! | `{ns}.pause` | stop calling the processor | `false` |
//! | `{ns}.threads` | worker count, at least 1 | `1` |
//! | `{ns}.sleep.ms` | idle and pause sleep | `1000` |
//! | `{ns}.tps` | permits per second, at least [`MIN_RATE`] | `100.0` |
//! | `{ns}.retries` | retries after the first attempt | `3` |
//! | `{ns}.retry.interval` | retry backoff, at most 365 days | `5 minutes` |
//! | `{ns}.limit` | batch size | `100` |

use std::time::Duration;

use tracing::warn;

use crate::{
    config_store::ConfigStore,
    rate_limit::MIN_RATE,
    retry::RetrySettings,
};

/// Default idle sleep.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1000);
/// Default throughput in permits per second.
pub const DEFAULT_THROUGHPUT: f64 = 100.0;
/// Default batch size.
pub const DEFAULT_BATCH_LIMIT: usize = 100;
/// Default retry backoff as stored in configuration.
pub const DEFAULT_RETRY_INTERVAL: &str = "5 minutes";
/// Longest accepted retry backoff.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration keys of one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyKeys {
    /// `{ns}.pause`
    pub pause: String,
    /// `{ns}.threads`
    pub threads: String,
    /// `{ns}.sleep.ms`
    pub idle_sleep: String,
    /// `{ns}.tps`
    pub throughput: String,
    /// `{ns}.retries`
    pub max_retries: String,
    /// `{ns}.retry.interval`
    pub retry_interval: String,
    /// `{ns}.limit`
    pub batch_limit: String,
}

impl PolicyKeys {
    /// Builds the keys for `namespace`.
    pub fn new(namespace: &str) -> Self {
        let ns = namespace.trim_end_matches('.');
        Self {
            pause: format!("{ns}.pause"),
            threads: format!("{ns}.threads"),
            idle_sleep: format!("{ns}.sleep.ms"),
            throughput: format!("{ns}.tps"),
            max_retries: format!("{ns}.retries"),
            retry_interval: format!("{ns}.retry.interval"),
            batch_limit: format!("{ns}.limit"),
        }
    }
}

/// Effective policy of an engine at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorPolicy {
    /// Whether workers skip `process()`.
    pub paused: bool,
    /// Worker count.
    pub threads: usize,
    /// Sleep after an idle or failed iteration and between pause checks.
    pub idle_sleep: Duration,
    /// Permits per second.
    pub throughput: f64,
    /// Retry budget and backoff.
    pub retry: RetrySettings,
    /// Maximum jobs claimed per iteration.
    pub batch_limit: usize,
}

impl Default for ProcessorPolicy {
    fn default() -> Self {
        Self {
            paused: false,
            threads: 1,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            throughput: DEFAULT_THROUGHPUT,
            retry: RetrySettings::default(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl ProcessorPolicy {
    /// Reads the policy for `keys` from the store's current snapshot.
    ///
    /// Invalid values fall back to their defaults. Worker count and batch
    /// size are clamped to at least one, throughput to at least [`MIN_RATE`]
    /// and the retry backoff to at most [`MAX_RETRY_INTERVAL`].
    pub fn load(store: &ConfigStore, keys: &PolicyKeys) -> Self {
        let defaults = Self::default();

        let threads = store.get::<i64>(&keys.threads, 1);
        let threads = usize::try_from(threads.max(1)).unwrap_or(1);

        let idle_sleep_ms = store.get::<i64>(&keys.idle_sleep, 1000);
        let idle_sleep = u64::try_from(idle_sleep_ms)
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_sleep);

        let throughput = store.get::<f64>(&keys.throughput, DEFAULT_THROUGHPUT);
        let throughput = if throughput.is_finite() && throughput >= MIN_RATE {
            throughput
        } else if throughput.is_finite() && throughput > 0.0 {
            warn!(key = %keys.throughput, value = throughput, "throughput raised to minimum");
            MIN_RATE
        } else {
            warn!(key = %keys.throughput, value = throughput, "throughput must be positive");
            DEFAULT_THROUGHPUT
        };

        let max_retries = store.get::<i64>(&keys.max_retries, 3);
        let max_retries = u32::try_from(max_retries).unwrap_or(defaults.retry.max_retries);

        let interval: String = store.get(&keys.retry_interval, DEFAULT_RETRY_INTERVAL.to_string());
        let backoff = parse_interval(&interval).unwrap_or_else(|| {
            warn!(key = %keys.retry_interval, value = %interval, "unparsable retry interval");
            defaults.retry.backoff
        });
        let backoff = if backoff > MAX_RETRY_INTERVAL {
            warn!(key = %keys.retry_interval, value = %interval, "retry interval capped");
            MAX_RETRY_INTERVAL
        } else {
            backoff
        };

        let batch_limit = store.get::<i64>(&keys.batch_limit, 100);
        let batch_limit = usize::try_from(batch_limit.max(1)).unwrap_or(DEFAULT_BATCH_LIMIT);

        Self {
            paused: store.get_flag(&keys.pause, false),
            threads,
            idle_sleep,
            throughput,
            retry: RetrySettings::new(max_retries, backoff),
            batch_limit,
        }
    }
}

/// Parses an interval such as `5 minutes`, `0 minute`, `30s`, `2h` or `90`.
///
/// A bare number is seconds. Units may be abbreviated or pluralized.
pub fn parse_interval(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount.parse().ok()?;

    let seconds_per_unit = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
        "d" | "day" | "days" => 24 * 60 * 60,
        "ms" | "millis" | "millisecond" | "milliseconds" => {
            return Some(Duration::from_millis(amount));
        },
        _ => return None,
    };

    amount.checked_mul(seconds_per_unit).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use proptest::prelude::*;

    use super::*;
    use crate::{config_store::ConfigSource, error::Result};

    #[derive(Debug)]
    struct Unused;

    #[async_trait::async_trait]
    impl ConfigSource for Unused {
        async fn load(&self) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
    }

    fn store(pairs: &[(&str, &str)]) -> ConfigStore {
        let entries = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ConfigStore::with_snapshot(Arc::new(Unused), entries)
    }

    #[test]
    fn keys_follow_namespace() {
        let keys = PolicyKeys::new("user.processor.email.");
        assert_eq!(keys.pause, "user.processor.email.pause");
        assert_eq!(keys.idle_sleep, "user.processor.email.sleep.ms");
        assert_eq!(keys.retry_interval, "user.processor.email.retry.interval");
    }

    #[test]
    fn empty_store_yields_defaults() {
        let policy = ProcessorPolicy::load(&store(&[]), &PolicyKeys::new("ns"));
        assert_eq!(policy, ProcessorPolicy::default());
    }

    #[test]
    fn configured_values_are_read() {
        let policy = ProcessorPolicy::load(
            &store(&[
                ("ns.pause", "true"),
                ("ns.threads", "5"),
                ("ns.sleep.ms", "250"),
                ("ns.tps", "2"),
                ("ns.retries", "1"),
                ("ns.retry.interval", "0 minute"),
                ("ns.limit", "10"),
            ]),
            &PolicyKeys::new("ns"),
        );

        assert!(policy.paused);
        assert_eq!(policy.threads, 5);
        assert_eq!(policy.idle_sleep, Duration::from_millis(250));
        assert!((policy.throughput - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.retry, RetrySettings::new(1, Duration::ZERO));
        assert_eq!(policy.batch_limit, 10);
    }

    #[test]
    fn out_of_range_values_are_clamped_or_defaulted() {
        let policy = ProcessorPolicy::load(
            &store(&[
                ("ns.threads", "0"),
                ("ns.sleep.ms", "-5"),
                ("ns.tps", "-1"),
                ("ns.retries", "-2"),
                ("ns.retry.interval", "soon"),
                ("ns.limit", "-10"),
            ]),
            &PolicyKeys::new("ns"),
        );

        assert_eq!(policy.threads, 1);
        assert_eq!(policy.idle_sleep, DEFAULT_IDLE_SLEEP);
        assert!((policy.throughput - DEFAULT_THROUGHPUT).abs() < f64::EPSILON);
        assert_eq!(policy.retry, RetrySettings::default());
        assert_eq!(policy.batch_limit, 1);
    }

    #[test]
    fn extreme_values_are_bounded() {
        let policy = ProcessorPolicy::load(
            &store(&[("ns.tps", "1e-300"), ("ns.retry.interval", "100000000 days")]),
            &PolicyKeys::new("ns"),
        );

        assert!((policy.throughput - MIN_RATE).abs() < f64::EPSILON);
        assert_eq!(policy.retry.backoff, MAX_RETRY_INTERVAL);
        assert!(matches!(
            policy.retry.decide(0, chrono::Utc::now()),
            crate::retry::RetryDecision::Reschedule { .. }
        ));
    }

    #[test]
    fn interval_forms() {
        assert_eq!(parse_interval("5 minutes"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("0 minute"), Some(Duration::ZERO));
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_interval("2 Hours"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_interval("1 day"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_interval("minutes"), None);
        assert_eq!(parse_interval("5 fortnights"), None);
        assert_eq!(parse_interval("-5 minutes"), None);
    }

    proptest! {
        #[test]
        fn minutes_round_trip(n in 0u64..100_000) {
            let minutes = parse_interval(&format!("{n} minutes"));
            prop_assert_eq!(minutes, Some(Duration::from_secs(n * 60)));
            prop_assert_eq!(parse_interval(&n.to_string()), Some(Duration::from_secs(n)));
        }

        #[test]
        fn arbitrary_text_never_panics(text in "\\PC*") {
            let _ = parse_interval(&text);
        }
    }
}
