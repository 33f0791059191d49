use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use tokio::time::{Duration, Instant};

/// Configures how quickly items may be re-added to a [`WorkQueue`](crate::WorkQueue).
///
/// The effective delay for an item is the larger of its own exponential
/// backoff and the delay imposed by the queue-wide token bucket.
#[derive(Clone, Debug)]
pub struct RateLimit {
    /// The delay applied to an item's first rate-limited add.
    pub base_delay: Duration,

    /// The upper bound on an item's backoff.
    pub max_delay: Duration,

    /// The sustained rate of rate-limited adds across all items. A value of
    /// zero disables the bucket.
    pub qps: f64,

    /// The number of rate-limited adds permitted in a burst.
    pub burst: u32,
}

pub(crate) struct RateLimiter<T> {
    limit: RateLimit,
    failures: Mutex<HashMap<T, u32>>,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

// === impl RateLimit ===

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

// === impl RateLimiter ===

impl<T> RateLimiter<T>
where
    T: Clone + Eq + Hash,
{
    pub(crate) fn new(limit: RateLimit) -> Self {
        let bucket = Bucket {
            tokens: limit.burst as f64,
            last: Instant::now(),
        };
        Self {
            limit,
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(bucket),
        }
    }

    /// Returns how long `item` must wait before it is added, recording the
    /// attempt against the item's backoff.
    pub(crate) fn when(&self, item: &T) -> Duration {
        self.backoff(item).max(self.reserve())
    }

    pub(crate) fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    pub(crate) fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }

    fn backoff(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        let RateLimit {
            base_delay,
            max_delay,
            ..
        } = self.limit;
        2u32.checked_pow(exp)
            .and_then(|factor| base_delay.checked_mul(factor))
            .map_or(max_delay, |delay| delay.min(max_delay))
    }

    fn reserve(&self) -> Duration {
        let RateLimit { qps, burst, .. } = self.limit;
        if qps <= 0.0 {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * qps).min(burst as f64);

        // Tokens may go negative: each reservation beyond the burst waits for
        // its share of the refill.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / qps)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff_only(base_ms: u64, max_ms: u64) -> RateLimiter<&'static str> {
        RateLimiter::new(RateLimit {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            qps: 0.0,
            burst: 0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_capped() {
        let limiter = backoff_only(5, 30);
        let delays = (0..5)
            .map(|_| limiter.when(&"a").as_millis())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        assert_eq!(limiter.num_requeues(&"a"), 5);

        // Other items have their own history.
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_backoff() {
        let limiter = backoff_only(5, 1000);
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_exponents_saturate() {
        let limiter = backoff_only(5, 1000);
        for _ in 0..100 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_limits_bursts() {
        let limiter = RateLimiter::new(RateLimit {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            qps: 1.0,
            burst: 2,
        });
        assert_eq!(limiter.when(&"a"), Duration::ZERO);
        assert_eq!(limiter.when(&"b"), Duration::ZERO);
        assert_eq!(limiter.when(&"c"), Duration::from_secs(1));

        // The bucket refills over time.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(limiter.when(&"d"), Duration::ZERO);
    }
}
