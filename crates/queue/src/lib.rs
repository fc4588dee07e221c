//! Work queue: per-key coalescing, processing bookkeeping and rate-limited retries.
//!
//! Semantics follow the classic controller work queue:
//! - an item added while another with the same key is pending replaces it
//!   (last writer wins) instead of queueing twice;
//! - an item added while its key is being processed waits until [`WorkQueue::done`];
//! - after [`WorkQueue::shut_down`], [`WorkQueue::get`] hands out what is left and
//!   then returns `None`.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ccop_core::Keyed;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub mod limiter;

pub use limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
};

struct State<T> {
    /// Keys ready to be handed out, FIFO.
    queue: VecDeque<String>,
    /// Latest pending item per key. Every key in `queue` has an entry here.
    dirty: FxHashMap<String, T>,
    processing: FxHashSet<String>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
    shutdown: CancellationToken,
}

/// Cloneable handle to a shared work queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Keyed + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Keyed + Send + 'static,
{
    /// Queue with the default controller rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limiter(Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(limiter: Box<dyn RateLimiter>) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashMap::default(),
            processing: FxHashSet::default(),
            shutting_down: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                notify: Notify::new(),
                limiter,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `item`, coalescing with any pending item for the same key.
    /// No-op once the queue is shutting down.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down {
            trace!(key = %item.key(), "queue shutting down; add ignored");
            return;
        }
        counter!("ccop_queue_adds_total", 1u64);
        let key = item.key().to_string();
        if st.dirty.insert(key.clone(), item).is_some() {
            trace!(key = %key, "coalesced with pending item");
            return;
        }
        self.schedule(st, key);
    }

    /// Like [`WorkQueue::add`], but an item already pending for the key wins.
    fn add_unless_pending(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let key = item.key().to_string();
        if st.dirty.contains_key(&key) {
            trace!(key = %key, "newer item pending; delayed add dropped");
            return;
        }
        counter!("ccop_queue_adds_total", 1u64);
        st.dirty.insert(key.clone(), item);
        self.schedule(st, key);
    }

    fn schedule(&self, mut st: MutexGuard<'_, State<T>>, key: String) {
        if st.processing.contains(&key) {
            // Re-queued by `done`.
            return;
        }
        st.queue.push_back(key);
        gauge!("ccop_queue_depth", st.queue.len() as f64);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once shut down and drained.
    ///
    /// Every `Some` must be paired with exactly one [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if let Some(key) = st.queue.pop_front() {
                    gauge!("ccop_queue_depth", st.queue.len() as f64);
                    if let Some(item) = st.dirty.remove(&key) {
                        st.processing.insert(key);
                        return Some(item);
                    }
                    continue;
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release the processing marker for an item obtained from [`WorkQueue::get`].
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        let key = item.key();
        st.processing.remove(key);
        if st.dirty.contains_key(key) {
            st.queue.push_back(key.to_string());
            gauge!("ccop_queue_depth", st.queue.len() as f64);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Re-add `item` after the delay its key has earned, counting one more requeue.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.shared.limiter.when(item.key());
        counter!("ccop_queue_retries_total", 1u64);
        debug!(key = %item.key(), delay_ms = %delay.as_millis(), "requeue with backoff");
        self.add_after(item, delay);
    }

    /// Add `item` once `delay` has elapsed. Dropped if the queue shuts down first,
    /// or if another item for the same key is pending when the delay runs out.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add_unless_pending(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add_unless_pending(item),
                _ = queue.shared.shutdown.cancelled() => {}
            }
        });
    }

    /// Reset the retry counter for the item's key.
    pub fn forget(&self, item: &T) {
        self.shared.limiter.forget(item.key());
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared.limiter.num_requeues(item.key())
    }

    /// Stop accepting items and wake every waiting [`WorkQueue::get`].
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        debug!(pending = st.queue.len(), "queue shutting down");
        drop(st);
        self.shared.shutdown.cancel();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
