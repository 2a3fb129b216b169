//! Deduplicating, rate-limited work queue
//!
//! Keys move through three sets:
//!
//! - `queue`: waiting to be handed to a worker, each key at most once
//! - `dirty`: needs processing (superset of `queue`)
//! - `processing`: currently held by a worker
//!
//! Adding a key that is being processed only marks it dirty; `done()` puts it
//! back on the queue. Repeated adds therefore coalesce into one additional
//! pass, and no key is ever handed to two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::rate_limiter::RateLimiter;

/// Bounds required of queue keys
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

/// Handle to a work queue; clones share the same queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Delayed adds not yet due, with the instant they fire
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue; `name` only appears in logs
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        self.inner.add(key);
    }

    /// Add `key` once `delay` has elapsed
    ///
    /// A pending delayed add for the same key is kept if it fires earlier.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&key) {
                if *existing <= ready_at {
                    return;
                }
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(queue = %self.inner.name, ?key, "No runtime for delayed add, adding now");
            self.inner.state.lock().waiting.remove(&key);
            self.add(key);
            return;
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            inner.fire(key, ready_at);
        });
    }

    /// Add `key` after the delay chosen by the rate limiter
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.rate_limiter.when(&key);
        trace!(queue = %self.inner.name, ?key, delay_ms = delay.as_millis(), "Requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's memory of `key`
    pub fn forget(&self, key: &K) {
        self.inner.rate_limiter.forget(key);
    }

    /// Failures recorded for `key`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(key)
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shut down. The caller must call
    /// [`WorkQueue::done`] when it finishes with the key.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before the state check so a concurrent add or
            // shutdown between the check and the await is not missed.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `key`; requeues it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and discard queued work
    ///
    /// Waiters in [`WorkQueue::get`] return `None`; later adds are ignored.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.waiting.clear();
        }
        debug!(queue = %self.inner.name, "Work queue shut down");
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl<K: QueueKey> Inner<K> {
    fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Delayed add is due; skipped if superseded by an earlier one
    fn fire(&self, key: K, ready_at: Instant) {
        {
            let mut state = self.state.lock();
            match state.waiting.get(&key) {
                Some(at) if *at == ready_at => {
                    state.waiting.remove(&key);
                }
                _ => return,
            }
        }
        self.add(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::ItemExponentialFailureRateLimiter;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn repeated_adds_coalesce() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_once_on_done() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();

        // Not handed out again while held
        q.add("a".to_string());
        q.add("a".to_string());
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, "a");
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn done_without_new_add_drops_the_key() {
        let q = queue();
        q.add("a".to_string());
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_and_discards_work() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_discards_queued_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.shut_down();
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_and_keeps_earliest() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(10));
        q.add_after("a".to_string(), Duration::from_secs(2));
        q.add_after("a".to_string(), Duration::from_secs(5));
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(q.len(), 1);
        let key = q.get().await.unwrap();
        q.done(&key);

        // Superseded timers do not fire again
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_until_forgotten() {
        let q = queue();
        let key = "a".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(), 1);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_a_key() {
        let q = queue();
        for i in 0..50 {
            q.add(format!("k{}", i % 5));
        }
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let seen = Arc::clone(&seen);
            handles.push(tokio::spawn(async move {
                while let Some(key) = tokio::time::timeout(Duration::from_millis(50), q.get())
                    .await
                    .ok()
                    .flatten()
                {
                    assert!(seen.lock().insert(key.clone()), "{key} handed out twice");
                    tokio::task::yield_now().await;
                    seen.lock().remove(&key);
                    q.done(&key);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(q.is_empty());
    }
}
