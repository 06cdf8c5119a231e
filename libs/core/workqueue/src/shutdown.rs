//! Orderly shutdown of a running worker.

use crate::iterator::PullIterator;
use crate::pool::WorkerPool;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Running,
    ShuttingDown,
    Terminated,
}

/// How fetching is cut off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Cancel pending fetches immediately.
    Stop,
    /// Let in-transit messages through before closing.
    Drain,
}

/// Result reported by `wait()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every dispatch loop and handler finished within the grace period.
    CleanShutdown,
    /// Handlers were still running when the grace period ran out.
    ShutdownTimeout,
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownOutcome::CleanShutdown => write!(f, "clean shutdown"),
            ShutdownOutcome::ShutdownTimeout => write!(f, "shutdown timeout"),
        }
    }
}

/// Drives `Running → ShuttingDown → Terminated`.
///
/// The first stop or drain request wins; later requests are no-ops. The
/// controller is the only component that closes the pull iterator.
pub struct ShutdownController {
    iterator: Arc<PullIterator>,
    pool: Arc<WorkerPool>,
    grace: Duration,
    state: watch::Sender<ControllerState>,
    mode: OnceLock<ShutdownMode>,
    outcome: watch::Sender<Option<ShutdownOutcome>>,
}

impl ShutdownController {
    pub fn new(iterator: Arc<PullIterator>, pool: Arc<WorkerPool>, grace: Duration) -> Self {
        let (state, _) = watch::channel(ControllerState::Running);
        let (outcome, _) = watch::channel(None);
        Self {
            iterator,
            pool,
            grace,
            state,
            mode: OnceLock::new(),
            outcome,
        }
    }

    /// Request shutdown. Returns `false` if one was already requested.
    pub fn request(&self, mode: ShutdownMode) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == ControllerState::Running {
                *state = ControllerState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !first {
            debug!(?mode, "Shutdown already requested");
            return false;
        }

        let _ = self.mode.set(mode);
        info!(?mode, grace = ?self.grace, "Shutdown requested");
        match mode {
            ShutdownMode::Stop => self.iterator.stop(),
            ShutdownMode::Drain => self.iterator.drain(),
        };
        true
    }

    pub fn stop(&self) -> bool {
        self.request(ShutdownMode::Stop)
    }

    pub fn drain(&self) -> bool {
        self.request(ShutdownMode::Drain)
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// The mode of the winning request, once there is one.
    pub fn mode(&self) -> Option<ShutdownMode> {
        self.mode.get().copied()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Block until `Terminated` and report how shutdown went.
    pub async fn wait(&self) -> ShutdownOutcome {
        let mut outcome = self.outcome.subscribe();
        loop {
            if let Some(done) = *outcome.borrow_and_update() {
                return done;
            }
            if outcome.changed().await.is_err() {
                // Controller dropped before finishing
                return ShutdownOutcome::ShutdownTimeout;
            }
        }
    }

    /// Watch the dispatch loops until shutdown completes.
    ///
    /// If the loops end without a request (a fatal fault), that counts as a
    /// stop request and `true` is returned.
    pub(crate) async fn supervise(&self, mut loops: JoinSet<()>) -> bool {
        let mut state = self.state.subscribe();
        let fatal = tokio::select! {
            biased;
            _ = shutdown_requested(&mut state) => false,
            _ = join_loops(&mut loops) => {
                error!("Dispatch loops ended without a shutdown request");
                self.stop();
                true
            }
        };

        let started = Instant::now();
        let joined = timeout(self.grace, async {
            join_loops(&mut loops).await;
            self.pool.join_all().await;
        })
        .await;

        let outcome = match joined {
            Ok(()) => {
                info!(elapsed = ?started.elapsed(), "All handlers finished");
                ShutdownOutcome::CleanShutdown
            }
            Err(_) => {
                warn!(
                    grace = ?self.grace,
                    in_flight = self.pool.in_flight(),
                    "Grace period elapsed with handlers still running"
                );
                // Handlers live on the pool and keep running until `abort`
                loops.abort_all();
                ShutdownOutcome::ShutdownTimeout
            }
        };

        self.pool.close();
        self.iterator.stop();
        self.outcome.send_replace(Some(outcome));
        self.state.send_replace(ControllerState::Terminated);
        info!(%outcome, "Worker terminated");
        fatal
    }

    /// Abort running handlers after a timeout.
    pub fn abort(&self) {
        self.pool.abort_all();
    }
}

async fn shutdown_requested(state: &mut watch::Receiver<ControllerState>) {
    let _ = state.wait_for(|s| *s != ControllerState::Running).await;
}

async fn join_loops(loops: &mut JoinSet<()>) {
    while let Some(result) = loops.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Dispatch loop panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use crate::config::{ConsumerDescriptor, HeartbeatPolicy, StreamDescriptor};
    use crate::iterator::{PullOptions, SessionState};
    use crate::metrics::QueueMetrics;

    async fn controller(grace: Duration) -> Arc<ShutdownController> {
        let broker = MemoryBroker::new();
        broker
            .ensure_stream(&StreamDescriptor::work_queue("jobs", &["jobs.>"]))
            .await
            .unwrap();
        let handle = broker
            .create_or_update_consumer("jobs", &ConsumerDescriptor::durable("c"))
            .await
            .unwrap();
        let iterator = Arc::new(PullIterator::start(
            Arc::new(broker),
            handle,
            PullOptions {
                batch: 1,
                expires: Duration::from_secs(30),
                heartbeat: HeartbeatPolicy::default(),
            },
            QueueMetrics::new("jobs", "c"),
        ));
        Arc::new(ShutdownController::new(iterator, Arc::new(WorkerPool::new(2)), grace))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_wins() {
        let controller = controller(Duration::from_secs(1)).await;
        tokio::spawn({
            let controller = controller.clone();
            async move { controller.supervise(JoinSet::new()).await; }
        });

        assert!(controller.drain());
        assert!(!controller.stop());
        assert!(!controller.drain());
        assert_eq!(controller.mode(), Some(ShutdownMode::Drain));

        assert_eq!(controller.wait().await, ShutdownOutcome::CleanShutdown);
        assert_eq!(controller.state(), ControllerState::Terminated);
        assert_eq!(controller.iterator.state(), SessionState::Stopped);

        // Requests after termination are no-ops
        assert!(!controller.stop());
        assert_eq!(controller.state(), ControllerState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_bounds_join() {
        let controller = controller(Duration::from_secs(2)).await;
        controller
            .pool
            .submit(tokio::time::sleep(Duration::from_secs(3600)))
            .await
            .unwrap();
        tokio::spawn({
            let controller = controller.clone();
            async move { controller.supervise(JoinSet::new()).await; }
        });

        controller.stop();
        assert_eq!(controller.wait().await, ShutdownOutcome::ShutdownTimeout);
        assert_eq!(controller.pool.in_flight(), 1);

        controller.abort();
        controller.pool.join_all().await;
        assert_eq!(controller.pool.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_exit_without_request_counts_as_stop() {
        let controller = controller(Duration::from_secs(1)).await;
        let mut loops = JoinSet::new();
        loops.spawn(async {});

        assert!(controller.supervise(loops).await);
        assert_eq!(controller.mode(), Some(ShutdownMode::Stop));
        assert_eq!(controller.wait().await, ShutdownOutcome::CleanShutdown);
    }
}
