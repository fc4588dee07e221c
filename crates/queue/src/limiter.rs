//! Retry policies: how long a key waits before it is handed out again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again. Counts as one requeue.
    fn when(&self, key: &str) -> Duration;
    /// Stop tracking `key`; its requeue count drops back to zero.
    fn forget(&self, key: &str);
    fn num_requeues(&self, key: &str) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<String, u32>>,
}

impl ItemExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl Default for ItemExponentialRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ItemExponentialRateLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let n = failures.entry(key.to_string()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let nanos = self.base.as_nanos() as f64 * 2f64.powi(exp.min(i32::MAX as u32) as i32);
        if !nanos.is_finite() || nanos >= self.max.as_nanos() as f64 {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }

    fn forget(&self, key: &str) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys. Does not track requeues.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &str) -> Duration {
        let mut b = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        // Reserve a token; a negative balance is time owed.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Longest delay among several limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &str) -> Duration {
        // Every limiter must observe the requeue, so no short-circuit.
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff (5ms..1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::default()),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let l = ItemExponentialRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10));
        let got: Vec<_> = (0..6).map(|_| l.when("a")).collect();
        let ms = |n| Duration::from_millis(n);
        assert_eq!(got, vec![ms(1), ms(2), ms(4), ms(8), ms(10), ms(10)]);
        assert_eq!(l.num_requeues("a"), 6);
        assert_eq!(l.num_requeues("b"), 0);
        l.forget("a");
        assert_eq!(l.num_requeues("a"), 0);
        assert_eq!(l.when("a"), ms(1));
    }

    #[test]
    fn exponential_survives_huge_exponents() {
        let l = ItemExponentialRateLimiter::default();
        for _ in 0..2000 {
            l.when("k");
        }
        assert_eq!(l.when("k"), Duration::from_secs(1000));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let l = BucketRateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(l.when("x"), Duration::ZERO);
        }
        let d = l.when("x");
        assert!(d > Duration::from_millis(50) && d <= Duration::from_millis(100), "{d:?}");
        assert_eq!(l.num_requeues("x"), 0);
    }

    #[test]
    fn max_of_takes_longest_and_forgets_everywhere() {
        let l = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponentialRateLimiter::new(Duration::from_millis(3), Duration::from_secs(1))),
        ]);
        assert_eq!(l.when("k"), Duration::from_millis(3));
        assert_eq!(l.when("k"), Duration::from_millis(6));
        assert_eq!(l.num_requeues("k"), 2);
        l.forget("k");
        assert_eq!(l.num_requeues("k"), 0);
    }
}
