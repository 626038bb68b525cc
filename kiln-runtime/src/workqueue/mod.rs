//! A deduplicating, rate limited queue of keys
//!
//! The queue guarantees that a key is never handed to two workers at once:
//!
//! - adding a key that is already queued is a no-op
//! - adding a key that is being processed marks it dirty, and it is queued again once
//!   the worker calls [`WorkQueue::done`]
//!
//! Delayed adds collapse onto the earliest pending deadline for a key.
use std::{collections::VecDeque, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

mod rate_limiter;
pub use rate_limiter::{ExponentialRateLimiter, RateLimiter};

struct State<K> {
    queue: VecDeque<K>,
    dirty: AHashSet<K>,
    processing: AHashSet<K>,
    /// Deadline of the earliest delayed add per key
    waiting: AHashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

/// Shared handle to a work queue
///
/// Cloning produces another handle to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// A queue retrying with the default [`ExponentialRateLimiter`]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, ExponentialRateLimiter::default())
    }

    pub fn with_rate_limiter(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: AHashSet::new(),
                    processing: AHashSet::new(),
                    waiting: AHashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queues `key` unless it is already queued
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queues `key` once `delay` has passed
    ///
    /// An earlier pending deadline for the same key wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            match state.waiting.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.waiting.insert(key.clone(), deadline);
                }
            }
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.inner.state.lock();
                if state.waiting.get(&key) == Some(&deadline) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Queues `key` after the rate limiter's delay for it
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        tracing::trace!(queue = %self.inner.name, ?key, ?delay, "requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Resets the retry state of `key`
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Number of rate limited requeues since `key` was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Waits for the next key and marks it as being processed
    ///
    /// Returns `None` once the queue is shut down. Every key returned must be handed
    /// back with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as no longer being processed, queueing it again if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops handing out keys and wakes every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys ready to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
