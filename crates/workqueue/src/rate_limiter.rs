//! # Rate Limiters
//!
//! Decide how long a failed key waits before it is handed out again.
//!
//! The default controller policy combines a per-key exponential backoff
//! (5ms, 10ms, 20ms, ... capped at 1000s) with an overall token bucket
//! (10 qps, burst 100) and uses whichever delay is larger.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Per-key retry delay policy used by [`WorkQueue::add_rate_limited`](crate::WorkQueue::add_rate_limited).
pub trait RateLimiter<T>: Send + Sync {
    /// Returns how long `item` should wait before being re-added, and records
    /// one more failure for it.
    fn when(&self, item: &T) -> Duration;

    /// Clears the failure history for `item`.
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential per-key backoff
///
/// The n-th consecutive failure of a key waits `base * 2^n`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialFailureRateLimiter<T> {
    /// Create a limiter with the given base delay and cap
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for a key that has already failed `failures` times (stateless)
    #[must_use]
    fn backoff_for(base: Duration, max: Duration, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }
}

impl<T> RateLimiter<T> for ItemExponentialFailureRateLimiter<T>
where
    T: Eq + Hash + Clone + Send,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = Self::backoff_for(self.base, self.max, *count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket, shared by every key
///
/// Each call to `when` reserves a token; once the bucket runs dry the
/// returned delay is the time until the reserved token becomes available.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket refilling at `qps` tokens per second, holding at most `burst`
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = self.burst.min(bucket.tokens + elapsed * self.qps);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines several limiters, waiting for the longest of their delays
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    /// Create a limiter from its parts
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> std::fmt::Debug for MaxOfRateLimiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Rate limiter used by the label sync controllers
///
/// Per-key exponential backoff from 5ms up to 1000s, combined with an overall
/// bucket of 10 qps and a burst of 100.
#[must_use]
pub fn default_controller_rate_limiter<T>() -> Box<dyn RateLimiter<T>>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    Box::new(MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = "default/web-0".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.when(&key), Duration::from_millis(40));
        assert_eq!(limiter.num_requeues(&key), 4);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_secs(1), Duration::from_secs(10));
        let key = "n1".to_string();

        assert_eq!(limiter.when(&key), Duration::from_secs(1));
        assert_eq!(limiter.when(&key), Duration::from_secs(2));
        assert_eq!(limiter.when(&key), Duration::from_secs(4));
        assert_eq!(limiter.when(&key), Duration::from_secs(8));
        // 16s would exceed the cap
        assert_eq!(limiter.when(&key), Duration::from_secs(10));
        assert_eq!(limiter.when(&key), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_survives_huge_failure_counts() {
        let max = Duration::from_secs(1000);
        assert_eq!(
            ItemExponentialFailureRateLimiter::<String>::backoff_for(Duration::from_millis(5), max, 64),
            max
        );
        assert_eq!(
            ItemExponentialFailureRateLimiter::<String>::backoff_for(Duration::from_millis(5), max, u32::MAX),
            max
        );
    }

    #[test]
    fn test_exponential_backoff_forget_resets() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let key = "ns/p1".to_string();

        limiter.when(&key);
        limiter.when(&key);
        limiter.forget(&key);

        assert_eq!(limiter.num_requeues(&key), 0);
        // Should restart from beginning after success
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn test_exponential_backoff_keys_are_independent() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let a = "a".to_string();
        let b = "b".to_string();

        limiter.when(&a);
        limiter.when(&a);

        assert_eq!(limiter.when(&b), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&a), 2);
        assert_eq!(limiter.num_requeues(&b), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        let key = "k".to_string();

        assert_eq!(RateLimiter::<String>::when(&limiter, &key), Duration::ZERO);
        assert_eq!(RateLimiter::<String>::when(&limiter, &key), Duration::ZERO);

        let delay = RateLimiter::<String>::when(&limiter, &key);
        assert!(delay > Duration::from_millis(90) && delay <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_over_time() {
        let limiter = BucketRateLimiter::new(10.0, 1);
        let key = "k".to_string();

        assert_eq!(RateLimiter::<String>::when(&limiter, &key), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(RateLimiter::<String>::when(&limiter, &key), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_secs(3),
                Duration::from_secs(60),
            )),
            Box::new(BucketRateLimiter::new(10.0, 100)),
        ]);
        let key = "n1".to_string();

        assert_eq!(limiter.when(&key), Duration::from_secs(3));
        assert_eq!(limiter.when(&key), Duration::from_secs(6));
        assert_eq!(limiter.num_requeues(&key), 2);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
