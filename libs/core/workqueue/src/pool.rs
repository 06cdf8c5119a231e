//! Bounded worker pool.

use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Runs at most `capacity` tasks at once.
///
/// `submit` waits for a free slot *before* spawning, so the number of
/// spawned-but-unfinished tasks never exceeds the capacity and a slow
/// handler applies back-pressure to the fetch loop.
pub struct WorkerPool {
    capacity: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    running: Arc<AtomicUsize>,
    closed: AtomicBool,
    metrics: Option<QueueMetrics>,
}

/// Decrements the running count when a task ends, including by panic or abort.
struct RunningGuard {
    running: Arc<AtomicUsize>,
    metrics: Option<QueueMetrics>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let now = self.running.fetch_sub(1, Ordering::SeqCst) - 1;
        if let Some(metrics) = &self.metrics {
            metrics.in_flight(now);
        }
    }
}

impl WorkerPool {
    /// Create a pool admitting `capacity` concurrent tasks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            metrics: None,
        }
    }

    /// Report the in-flight gauge through `metrics`.
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for a free slot, then spawn `task`.
    ///
    /// Fails with `PoolClosed` after [`close`](Self::close).
    pub async fn submit<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::PoolClosed);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::PoolClosed)?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::PoolClosed);
        }

        let guard = self.enter();

        let mut tasks = self.lock();
        reap(&mut tasks);
        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await;
        });
        Ok(())
    }

    /// Submit `task` and wait for its output.
    ///
    /// The task runs on the pool like any submitted task, so cancelling the
    /// caller does not cancel it; only [`abort_all`](Self::abort_all) does.
    /// Fails with `TaskAborted` if the task panicked or was aborted.
    pub async fn run<F>(&self, task: F) -> Result<F::Output, QueueError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(async move {
            let _ = done_tx.send(task.await);
        })
        .await?;
        done_rx.await.map_err(|_| QueueError::TaskAborted)
    }

    fn enter(&self) -> RunningGuard {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metrics) = &self.metrics {
            metrics.in_flight(now);
        }
        RunningGuard {
            running: self.running.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Stop admitting tasks. Running tasks are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for every task submitted before this call to finish.
    pub async fn join_all(&self) {
        // Tasks hold their permit until they end; the semaphore is fair, so
        // taking every permit waits exactly for earlier submissions.
        match self.permits.acquire_many(self.capacity as u32).await {
            Ok(all) => drop(all),
            Err(_) => debug!("Worker pool semaphore closed while joining"),
        }
        reap(&mut self.lock());
    }

    /// Abort every running task. Their messages stay unacknowledged.
    pub fn abort_all(&self) {
        let mut tasks = self.lock();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Aborting worker tasks");
        }
        tasks.abort_all();
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Collect finished tasks, logging panics.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Worker task panicked");
            }
        }
    }
}
