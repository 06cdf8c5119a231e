//! The queue worker: wires iterator, pool, acks and shutdown together.

use crate::ack::AckController;
use crate::broker::{Broker, ConsumerHandle};
use crate::config::{Topology, WorkerConfig};
use crate::error::{ProcessingError, QueueError};
use crate::handler::Handler;
use crate::health::HealthState;
use crate::iterator::{PullIterator, PullOptions, SessionState};
use crate::message::Message;
use crate::metrics::QueueMetrics;
use crate::pool::WorkerPool;
use crate::shutdown::{ControllerState, ShutdownController, ShutdownMode, ShutdownOutcome};
use std::future::pending;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A durable consumer ready to run.
pub struct QueueWorker {
    broker: Arc<dyn Broker>,
    config: WorkerConfig,
    consumer: ConsumerHandle,
    metrics: QueueMetrics,
    health: HealthState,
}

impl QueueWorker {
    /// Validate the configuration, ensure the stream and create or update
    /// the durable consumer.
    ///
    /// # Errors
    ///
    /// Configuration faults (including `FilterOverlap`) are returned as-is
    /// and should abort startup.
    pub async fn new(broker: Arc<dyn Broker>, config: WorkerConfig) -> Result<Self, QueueError> {
        config.validate()?;

        broker.ensure_stream(&config.stream).await?;
        let consumer = broker
            .create_or_update_consumer(&config.stream.name, &config.consumer)
            .await?;

        let metrics = QueueMetrics::new(&config.stream.name, &config.consumer.name);
        Ok(Self {
            broker,
            config,
            consumer,
            metrics,
            health: HealthState::new(),
        })
    }

    /// Report into an existing health state instead of a private one.
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = health;
        self
    }

    pub fn consumer(&self) -> &ConsumerHandle {
        &self.consumer
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Start consuming with `handler`. Must be called within a Tokio runtime.
    pub fn run<H: Handler>(self, handler: H) -> WorkerHandle {
        info!(
            stream = %self.config.stream.name,
            consumer = %self.consumer.name(),
            handler = handler.name(),
            parallelism = self.config.parallelism,
            topology = ?self.config.topology,
            "Starting queue worker"
        );

        let iterator = Arc::new(PullIterator::start(
            self.broker.clone(),
            self.consumer.clone(),
            PullOptions::from(&self.config),
            self.metrics.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(self.config.parallelism).with_metrics(self.metrics.clone()));
        let acks = AckController::new(
            self.broker.clone(),
            self.config.ack_timeout,
            self.consumer.max_deliver(),
            self.metrics.clone(),
        );
        let controller = Arc::new(ShutdownController::new(
            iterator.clone(),
            pool.clone(),
            self.config.shutdown_grace,
        ));

        let dispatch = Arc::new(Dispatch {
            iterator: iterator.clone(),
            pool: pool.clone(),
            acks,
            handler: Arc::new(handler),
            metrics: self.metrics,
            error_backoff: self.config.error_backoff,
        });

        let mut loops = JoinSet::new();
        match self.config.topology {
            Topology::PullThenDispatch => {
                loops.spawn(dispatch.dispatch_loop());
            }
            Topology::PullPerWorker => {
                for id in 0..self.config.parallelism {
                    loops.spawn(dispatch.clone().worker_loop(id));
                }
            }
        }

        tokio::spawn(self.health.clone().follow_liveness(iterator.liveness()));

        let health = self.health;
        let supervisor = controller.clone();
        tokio::spawn(async move {
            health.set_consuming(true).await;

            // Not ready from the first shutdown request on
            let mut state = supervisor.subscribe();
            let readiness = health.clone();
            tokio::spawn(async move {
                if state.wait_for(|s| *s != ControllerState::Running).await.is_ok() {
                    readiness.set_consuming(false).await;
                }
            });

            if supervisor.supervise(loops).await {
                health.set_fatal("dispatch loops ended unexpectedly").await;
            } else {
                health.set_consuming(false).await;
            }
        });

        WorkerHandle {
            controller,
            iterator,
            pool,
        }
    }

    /// Run until `shutdown_rx` turns `true`, then shut down with `mode`.
    pub async fn run_until<H: Handler>(
        self,
        handler: H,
        mut shutdown_rx: watch::Receiver<bool>,
        mode: ShutdownMode,
    ) -> ShutdownOutcome {
        let handle = self.run(handler);

        tokio::select! {
            outcome = handle.wait() => return outcome,
            _ = signalled(&mut shutdown_rx) => {
                info!(?mode, "Shutdown signal received");
                handle.request(mode);
            }
        }

        handle.wait().await
    }
}

async fn signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            // Sender gone without signalling: never shut down from here
            pending::<()>().await;
        }
    }
}

/// Control surface of a running worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    controller: Arc<ShutdownController>,
    iterator: Arc<PullIterator>,
    pool: Arc<WorkerPool>,
}

impl WorkerHandle {
    /// Cancel pending fetches and let running handlers finish.
    pub fn stop(&self) -> bool {
        self.controller.stop()
    }

    /// Hand out in-transit messages, then finish like `stop`.
    pub fn drain(&self) -> bool {
        self.controller.drain()
    }

    pub fn request(&self, mode: ShutdownMode) -> bool {
        self.controller.request(mode)
    }

    /// Block until `Terminated`.
    pub async fn wait(&self) -> ShutdownOutcome {
        self.controller.wait().await
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn session_state(&self) -> SessionState {
        self.iterator.state()
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Abort handlers still running after a `ShutdownTimeout`. Their
    /// messages are redelivered once `ack_wait` expires.
    pub fn abort(&self) {
        self.controller.abort();
    }
}

/// State shared by the dispatch loops.
struct Dispatch<H> {
    iterator: Arc<PullIterator>,
    pool: Arc<WorkerPool>,
    acks: AckController,
    handler: Arc<H>,
    metrics: QueueMetrics,
    error_backoff: Duration,
}

impl<H: Handler> Dispatch<H> {
    /// Fetch, then hand each message to the pool.
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            match self.iterator.fetch_next().await {
                Ok(message) => {
                    let sequence = message.sequence;
                    let ctx = self.clone();
                    if let Err(e) = self.pool.submit(async move { ctx.process(message).await }).await {
                        warn!(sequence, error = %e, "Pool closed, message left for redelivery");
                        break;
                    }
                }
                Err(e) => {
                    if !self.on_fetch_error(e).await {
                        break;
                    }
                }
            }
        }
        debug!("Dispatch loop exited");
    }

    /// One of N loops, each fetching and waiting for its own handler.
    ///
    /// The handler runs as a pool task, so ending this loop never cancels it.
    async fn worker_loop(self: Arc<Self>, id: usize) {
        loop {
            match self.iterator.fetch_next().await {
                Ok(message) => {
                    let sequence = message.sequence;
                    let ctx = self.clone();
                    match self.pool.run(async move { ctx.process(message).await }).await {
                        Ok(()) => {}
                        Err(QueueError::TaskAborted) => {
                            warn!(worker = id, sequence, "Handler did not finish, message left for redelivery");
                        }
                        Err(e) => {
                            warn!(worker = id, sequence, error = %e, "Pool closed, message left for redelivery");
                            break;
                        }
                    }
                }
                Err(e) => {
                    if !self.on_fetch_error(e).await {
                        break;
                    }
                }
            }
        }
        debug!(worker = id, "Worker loop exited");
    }

    /// Returns whether the loop should keep going.
    async fn on_fetch_error(&self, error: QueueError) -> bool {
        match error {
            QueueError::IteratorClosed => {
                debug!("Iterator closed");
                false
            }
            // The iterator already re-issued its pull request
            QueueError::MissingHeartbeat { .. } => {
                warn!(error = %error, "Pull session lost its heartbeat");
                true
            }
            e => {
                error!(error = %e, category = %e.category(), "Fetch failed");
                self.backoff().await;
                true
            }
        }
    }

    /// Sleep before the next fetch; cut short once shutdown begins.
    async fn backoff(&self) {
        let mut state = self.iterator.subscribe_state();
        tokio::select! {
            _ = tokio::time::sleep(self.error_backoff) => {}
            _ = leaves_active(&mut state) => {}
        }
    }

    async fn process(&self, message: Message) {
        let span = info_span!(
            "handle",
            handler = self.handler.name(),
            sequence = message.sequence,
            subject = %message.subject,
            delivery = message.delivery_count,
        );
        self.process_inner(message).instrument(span).await
    }

    async fn process_inner(&self, message: Message) {
        self.metrics.message_received(message.is_redelivery());
        if message.is_redelivery() {
            debug!("Redelivered message");
        }

        let started = Instant::now();
        let result = self.handler.handle(&message).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.handler_finished("ok", elapsed);
                self.report(self.acks.acknowledge(&message).await, "ack");
            }
            Err(e @ ProcessingError::Transient { .. }) => {
                self.metrics.handler_finished("transient", elapsed);
                warn!(error = %e, "Handler failed, requesting redelivery");
                if self.acks.is_last_delivery(&message) {
                    self.handler.on_exhausted(&message, &e).await;
                }
                self.report(self.acks.negative_acknowledge(&message).await, "nak");
            }
            Err(e @ ProcessingError::Permanent { .. }) => {
                self.metrics.handler_finished("permanent", elapsed);
                error!(error = %e, "Handler failed permanently, terminating delivery");
                self.report(self.acks.terminate(&message).await, "term");
            }
        }
    }

    fn report(&self, result: Result<(), QueueError>, kind: &'static str) {
        match result {
            Ok(()) => {}
            Err(e @ QueueError::AckDeadlineExceeded { .. }) => {
                warn!(error = %e, kind, "Late acknowledgment, the message is redelivered");
            }
            Err(e) => {
                warn!(error = %e, kind, "Acknowledgment failed, broker redelivers after ack wait");
            }
        }
    }
}

async fn leaves_active(state: &mut watch::Receiver<SessionState>) {
    let _ = state.wait_for(|s| *s != SessionState::Active).await;
}
