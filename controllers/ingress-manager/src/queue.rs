//! Rate-limited work queue.
//!
//! Keys, not objects, are queued. The queue guarantees:
//! - a key is pending at most once, however often it is added;
//! - a key handed to a worker is not handed out again until that worker
//!   calls [`WorkQueue::done`]; adds in the meantime mark it dirty and it is
//!   redelivered once afterwards;
//! - failed keys come back after a delay chosen by the [`BackoffPolicy`]
//!   from that key's consecutive-failure count.

use crate::backoff::BackoffPolicy;
use crate::key::Key;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready for a worker, in arrival order
    queue: VecDeque<Key>,
    /// Keys that need processing; superset of `queue`
    dirty: HashSet<Key>,
    /// Keys currently held by a worker
    processing: HashSet<Key>,
    /// Consecutive failures per key
    failures: HashMap<Key, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: Arc<dyn BackoffPolicy>,
}

/// Shared, deduplicating, rate-limited queue of keys.
///
/// Cloning is cheap and every clone refers to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("pending", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("backoff", &self.inner.backoff)
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl WorkQueue {
    /// Creates a new queue with the given requeue policy.
    pub fn new(name: impl Into<String>, backoff: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // No user code runs under this lock; a poisoned state is still consistent.
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: Key) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!("{}: dropping {} after shutdown", self.inner.name, key);
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!("{}: {} already pending", self.inner.name, key);
            return;
        }
        if state.processing.contains(&key) {
            trace!("{}: {} in flight, marked dirty", self.inner.name, key);
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: Key, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        debug!("{}: requeueing {} in {:?}", self.inner.name, key, delay);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Record a failure for `key` and requeue it after the policy's delay.
    pub fn add_rate_limited(&self, key: Key) {
        let delay = {
            let mut state = self.lock();
            if state.shutting_down {
                trace!("{}: dropping {} after shutdown", self.inner.name, key);
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// How many times `key` has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count for `key`.
    pub fn forget(&self, key: &Key) {
        self.lock().failures.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<Key> {
        loop {
            // Register interest before inspecting state so an add between the
            // check and the await still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
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

    /// Release `key` after a worker has finished with it.
    ///
    /// If the key was added while in flight it is queued again now.
    pub fn done(&self, key: &Key) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and refuse new ones. Pending keys are discarded.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        debug!("{}: shutting down", self.inner.name);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{ExponentialBackoff, NoBackoff};

    fn queue() -> WorkQueue {
        WorkQueue::new("test", Arc::new(NoBackoff))
    }

    #[tokio::test]
    async fn test_duplicate_adds_coalesce() {
        let queue = queue();
        queue.add(Key::new("default", "web"));
        queue.add(Key::new("default", "web"));
        queue.add(Key::new("default", "web"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(Key::new("default", "web")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_keep_arrival_order() {
        let queue = queue();
        queue.add(Key::new("default", "a"));
        queue.add(Key::new("default", "b"));
        queue.add(Key::new("default", "a"));

        assert_eq!(queue.get().await, Some(Key::new("default", "a")));
        assert_eq!(queue.get().await, Some(Key::new("default", "b")));
    }

    #[tokio::test]
    async fn test_in_flight_key_is_not_redelivered() {
        let queue = queue();
        let key = Key::new("default", "web");
        queue.add(key.clone());
        let held = queue.get().await.unwrap();

        queue.add(key.clone());
        queue.add(key.clone());
        assert!(queue.is_empty(), "in-flight key must wait for done()");

        queue.done(&held);
        assert_eq!(queue.len(), 1, "dirty key is redelivered exactly once");
        assert_eq!(queue.get().await, Some(key.clone()));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_dirty_does_not_requeue() {
        let queue = queue();
        queue.add(Key::new("default", "web"));
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add(Key::new("default", "web"));
        assert_eq!(waiter.await.unwrap(), Some(Key::new("default", "web")));
    }

    #[tokio::test]
    async fn test_requeue_count_and_forget() {
        let queue = queue();
        let key = Key::new("default", "web");
        assert_eq!(queue.num_requeues(&key), 0);

        queue.add_rate_limited(key.clone());
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 2);
        assert_eq!(queue.len(), 1);

        queue.forget(&key);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_honours_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let queue = WorkQueue::new("test", Arc::new(backoff));
        let key = Key::new("default", "web");
        let start = tokio::time::Instant::now();

        queue.add_rate_limited(key.clone());
        assert!(queue.is_empty(), "first retry waits for the base delay");

        assert_eq!(queue.get().await, Some(key.clone()));
        assert!(start.elapsed() >= Duration::from_secs(10));
        queue.done(&key);

        queue.add_rate_limited(key.clone());
        let second = tokio::time::Instant::now();
        assert_eq!(queue.get().await, Some(key));
        assert!(second.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiters() {
        let queue = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_no_adds_after_shutdown() {
        let queue = queue();
        queue.add(Key::new("default", "pending"));
        queue.shut_down();

        queue.add(Key::new("default", "web"));
        queue.add_rate_limited(Key::new("default", "web"));
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&Key::new("default", "web")), 0);
        assert_eq!(queue.get().await, None);
    }
}
