//! Worker pool.
//!
//! A fixed number of tokio tasks pull keys off the [`WorkQueue`] and hand them
//! to a [`Reconcile`] implementation. The queue guarantees a key is never held
//! by two workers at once, so the pool only has to decide what happens after
//! each attempt:
//!
//! - success forgets the key's failure history;
//! - a retryable error requeues the key with backoff while its requeue count
//!   is at most `max_retries`, otherwise the key is dropped and forgotten;
//! - a non-retryable error drops the key immediately.
//!
//! A panicking reconcile is caught and treated as a retryable error; the worker
//! keeps running.

use crate::error::ControllerError;
use crate::key::Key;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconciler::Reconcile;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs reconciles for keys taken from a shared queue.
pub struct WorkerPool<R: Reconcile> {
    queue: WorkQueue,
    reconciler: Arc<R>,
    workers: usize,
    max_retries: u32,
    metrics: Metrics,
}

impl<R: Reconcile> Clone for WorkerPool<R> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            reconciler: Arc::clone(&self.reconciler),
            workers: self.workers,
            max_retries: self.max_retries,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R: Reconcile> WorkerPool<R> {
    /// Creates a new pool; at least one worker is always started.
    pub fn new(
        queue: WorkQueue,
        reconciler: Arc<R>,
        workers: usize,
        max_retries: u32,
        metrics: Metrics,
    ) -> Self {
        Self {
            queue,
            reconciler,
            workers: workers.max(1),
            max_retries,
            metrics,
        }
    }

    /// Run workers until `cancel` fires.
    ///
    /// On cancellation the queue is shut down, reconciles already in flight
    /// are allowed to finish, and this returns once every worker has exited.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting {} workers on queue {}", self.workers, self.queue.name());

        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let worker = self.clone();
            workers.spawn(async move {
                while worker.process_next_item().await {}
                debug!("Worker {} stopped", id);
            });
        }

        cancel.cancelled().await;
        info!("Shutting down workers");
        self.queue.shut_down();

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Worker task failed: {}", e);
            }
        }
        info!("All workers stopped");
    }

    /// Take one key and reconcile it. Returns `false` once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.record_queue_depth();

        let timer = self.metrics.reconcile_duration.start_timer();
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ControllerError::Panicked(panic_message(panic.as_ref()))));
        timer.observe_duration();

        match result {
            Ok(outcome) => {
                debug!("Reconciled {}: {}", key, outcome);
                self.metrics.reconciles.with_label_values(&[outcome.as_str()]).inc();
                self.queue.forget(&key);
            }
            Err(e) => {
                self.metrics.reconciles.with_label_values(&[e.metric_label()]).inc();
                self.handle_error(&key, e);
            }
        }

        self.queue.done(&key);
        self.record_queue_depth();
        true
    }

    fn handle_error(&self, key: &Key, err: ControllerError) {
        if !err.is_retryable() {
            error!("Dropping {} from the queue: {}", key, err);
            self.drop_key(key);
            return;
        }

        let retries = self.queue.num_requeues(key);
        if retries <= self.max_retries {
            warn!("Error syncing {} (requeue {}): {}", key, retries + 1, err);
            self.queue.add_rate_limited(key.clone());
            self.metrics.requeues.inc();
            return;
        }

        error!("Dropping {} out of the queue after {} retries: {}", key, retries, err);
        self.drop_key(key);
    }

    fn drop_key(&self, key: &Key) {
        self.queue.forget(key);
        self.metrics.dropped.inc();
    }

    fn record_queue_depth(&self) {
        self.metrics
            .queue_depth
            .set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::NoBackoff;
    use crate::reconciler::ReconcileOutcome;
    use crate::test_utils::eventually;
    use cluster_client::ClusterError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Script = dyn Fn(&Key, u32) -> Result<ReconcileOutcome, ControllerError> + Send + Sync;

    /// Reconcile double that records every attempt and flags overlapping
    /// attempts on the same key.
    struct ScriptedReconciler {
        script: Box<Script>,
        work: Duration,
        attempts: Mutex<HashMap<Key, u32>>,
        in_flight: Mutex<HashSet<Key>>,
        overlapped: AtomicBool,
    }

    impl ScriptedReconciler {
        fn new<F>(script: F) -> Self
        where
            F: Fn(&Key, u32) -> Result<ReconcileOutcome, ControllerError> + Send + Sync + 'static,
        {
            Self {
                script: Box::new(script),
                work: Duration::ZERO,
                attempts: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                overlapped: AtomicBool::new(false),
            }
        }

        fn with_work(mut self, work: Duration) -> Self {
            self.work = work;
            self
        }

        fn attempts(&self, key: &Key) -> u32 {
            self.attempts.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait::async_trait]
    impl Reconcile for ScriptedReconciler {
        async fn reconcile(&self, key: &Key) -> Result<ReconcileOutcome, ControllerError> {
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.in_flight.lock().unwrap().remove(key);
            (self.script)(key, attempt)
        }
    }

    fn transient() -> ControllerError {
        ControllerError::Cluster(ClusterError::Request("connection reset".to_string()))
    }

    fn pool(
        reconciler: &Arc<ScriptedReconciler>,
        workers: usize,
        max_retries: u32,
    ) -> (WorkerPool<ScriptedReconciler>, WorkQueue, Metrics) {
        let queue = WorkQueue::new("test", Arc::new(NoBackoff));
        let metrics = Metrics::new().unwrap();
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::clone(reconciler),
            workers,
            max_retries,
            metrics.clone(),
        );
        (pool, queue, metrics)
    }

    #[tokio::test]
    async fn test_success_forgets_failures() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, attempt| {
            if attempt < 3 {
                Err(transient())
            } else {
                Ok(ReconcileOutcome::Created)
            }
        }));
        let (pool, queue, metrics) = pool(&reconciler, 1, 10);
        let key = Key::new("default", "web");
        queue.add(key.clone());

        assert!(pool.process_next_item().await);
        assert_eq!(queue.num_requeues(&key), 1);
        assert!(pool.process_next_item().await);
        assert_eq!(queue.num_requeues(&key), 2);
        assert!(pool.process_next_item().await);

        assert_eq!(queue.num_requeues(&key), 0);
        assert!(queue.is_empty());
        assert_eq!(metrics.requeues.get(), 2);
        assert_eq!(metrics.reconciles.with_label_values(&["created"]).get(), 1);
        assert_eq!(metrics.reconciles.with_label_values(&["cluster"]).get(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, _| Err(transient())));
        let (pool, queue, metrics) = pool(&reconciler, 1, 3);
        let key = Key::new("default", "web");
        queue.add(key.clone());

        // Requeued while the requeue count is 0..=max_retries, then dropped.
        for _ in 0..5 {
            assert!(pool.process_next_item().await);
        }

        assert_eq!(reconciler.attempts(&key), 5);
        assert!(queue.is_empty(), "key must be dropped after the last retry");
        assert_eq!(queue.num_requeues(&key), 0, "dropped key is forgotten");
        assert_eq!(metrics.requeues.get(), 4);
        assert_eq!(metrics.dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_still_requeues_once() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, _| Err(transient())));
        let (pool, queue, metrics) = pool(&reconciler, 1, 0);
        let key = Key::new("default", "web");
        queue.add(key.clone());

        assert!(pool.process_next_item().await);
        assert_eq!(queue.len(), 1);
        assert!(pool.process_next_item().await);

        assert_eq!(reconciler.attempts(&key), 2);
        assert!(queue.is_empty());
        assert_eq!(metrics.dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_not_retried() {
        let reconciler = Arc::new(ScriptedReconciler::new(|key, _| {
            key.split()?;
            Ok(ReconcileOutcome::InSync)
        }));
        let (pool, queue, metrics) = pool(&reconciler, 1, 10);
        let key = Key::from("/web");
        queue.add(key.clone());

        assert!(pool.process_next_item().await);

        assert_eq!(reconciler.attempts(&key), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues(&key), 0);
        assert_eq!(metrics.requeues.get(), 0);
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(metrics.reconciles.with_label_values(&["malformed_key"]).get(), 1);
    }

    #[tokio::test]
    async fn test_panicking_reconcile_is_retried() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, attempt| {
            if attempt == 1 {
                panic!("boom");
            }
            Ok(ReconcileOutcome::InSync)
        }));
        let (pool, queue, metrics) = pool(&reconciler, 1, 10);
        let key = Key::new("default", "web");
        queue.add(key.clone());

        assert!(pool.process_next_item().await);
        assert_eq!(metrics.reconciles.with_label_values(&["panicked"]).get(), 1);
        assert_eq!(queue.num_requeues(&key), 1);

        assert!(pool.process_next_item().await);
        assert_eq!(reconciler.attempts(&key), 2);
        assert_eq!(metrics.reconciles.with_label_values(&["in_sync"]).get(), 1);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_process_next_item_stops_after_shutdown() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, _| Ok(ReconcileOutcome::InSync)));
        let (pool, queue, _metrics) = pool(&reconciler, 1, 10);
        queue.shut_down();

        assert!(!pool.process_next_item().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_key_is_never_reconciled_concurrently() {
        let reconciler = Arc::new(
            ScriptedReconciler::new(|_, _| Ok(ReconcileOutcome::InSync))
                .with_work(Duration::from_millis(2)),
        );
        let (pool, queue, _metrics) = pool(&reconciler, 8, 10);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(pool.run(cancel.clone()));

        let keys: Vec<Key> = (0..4)
            .map(|i| Key::new("default", &format!("svc-{}", i)))
            .collect();
        for _ in 0..50 {
            for key in &keys {
                queue.add(key.clone());
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        eventually(|| queue.is_empty() && reconciler.in_flight.lock().unwrap().is_empty()).await;
        cancel.cancel();
        running.await.unwrap();

        assert!(!reconciler.overlapped.load(Ordering::SeqCst));
        for key in &keys {
            assert!(reconciler.attempts(key) >= 1);
        }
    }

    #[tokio::test]
    async fn test_run_drives_retries_then_drops() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, _| Err(transient())));
        let (pool, queue, metrics) = pool(&reconciler, 2, 2);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(pool.run(cancel.clone()));
        let key = Key::new("default", "web");

        queue.add(key.clone());
        eventually(|| metrics.dropped.get() == 1).await;

        assert_eq!(reconciler.attempts(&key), 4);
        cancel.cancel();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_shuts_down_queue_and_joins_workers() {
        let reconciler = Arc::new(ScriptedReconciler::new(|_, _| Ok(ReconcileOutcome::InSync)));
        let (pool, queue, _metrics) = pool(&reconciler, 3, 10);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(pool.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("workers did not stop")
            .unwrap();

        assert!(queue.is_shutting_down());
    }
}
