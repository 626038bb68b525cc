use std::{hash::Hash, time::Duration};

use ahash::AHashMap;
use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;

/// Decides how long a failing key waits before it is retried
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before the next retry of `key`, counting one more failure
    fn when(&self, key: &K) -> Duration;
    /// Clears all failure state for `key`
    fn forget(&self, key: &K);
    /// Failures counted for `key` since it was last forgotten
    fn num_requeues(&self, key: &K) -> u32;
}

struct ItemBackoff<B: BackoffBuilder> {
    backoff: B::Backoff,
    requeues: u32,
}

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`
pub struct ExponentialRateLimiter<K> {
    builder: ExponentialBuilder,
    max: Duration,
    items: Mutex<AHashMap<K, ItemBackoff<ExponentialBuilder>>>,
}

impl<K> ExponentialRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        let builder = ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(max)
            .with_factor(2.0)
            .with_max_times(usize::MAX);
        Self {
            builder,
            max,
            items: Mutex::new(AHashMap::new()),
        }
    }
}

impl<K> Default for ExponentialRateLimiter<K> {
    /// 5ms doubling up to 1000s
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K> RateLimiter<K> for ExponentialRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, key: &K) -> Duration {
        let mut items = self.items.lock();
        let item = items.entry(key.clone()).or_insert_with(|| ItemBackoff {
            backoff: self.builder.clone().build(),
            requeues: 0,
        });
        item.requeues = item.requeues.saturating_add(1);
        item.backoff.next().unwrap_or(self.max)
    }

    fn forget(&self, key: &K) {
        self.items.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.items.lock().get(key).map_or(0, |item| item.requeues)
    }
}
