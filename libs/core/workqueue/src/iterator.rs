//! The pull iterator: a single blocking `fetch_next` over a durable consumer.
//!
//! A background pump task owns the open pull request. Callers register
//! demand through a channel and receive exactly one message (or error) per
//! call:
//!
//! ```text
//! fetch_next() ──waiter──▶ pump ──pull()──▶ Broker
//!      ▲                    │ buffer, HeartbeatMonitor
//!      └──────message───────┘
//! ```
//!
//! The session moves `Active → Draining → Stopped` (or straight to
//! `Stopped`) and never backwards. Once `Stopped`, every pending and future
//! `fetch_next` fails with [`QueueError::IteratorClosed`].

use crate::broker::{Broker, ConsumerHandle, PullEvent, PullRequest, PullResponse};
use crate::config::{HeartbeatPolicy, WorkerConfig};
use crate::error::QueueError;
use crate::heartbeat::HeartbeatMonitor;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Lifecycle of a pull session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Pull requests are being issued.
    Active,
    /// No new pull requests; messages already in transit are still handed out.
    Draining,
    /// Closed for good.
    Stopped,
}

/// Pull settings for one iterator.
#[derive(Debug, Clone, Copy)]
pub struct PullOptions {
    pub batch: usize,
    pub expires: Duration,
    pub heartbeat: HeartbeatPolicy,
}

impl From<&WorkerConfig> for PullOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            batch: config.batch_size,
            expires: config.pull_expires,
            heartbeat: config.heartbeat,
        }
    }
}

type Waiter = oneshot::Sender<Result<Message, QueueError>>;

/// Move the session forward; returns whether the state changed.
fn advance(state: &watch::Sender<SessionState>, to: SessionState) -> bool {
    state.send_if_modified(|current| {
        if *current < to {
            *current = to;
            true
        } else {
            false
        }
    })
}

async fn stopped(state: &mut watch::Receiver<SessionState>) {
    // Sender lives as long as the iterator, an error also means closed
    let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
}

/// Fetch primitive shared by all dispatch loops.
pub struct PullIterator {
    state: Arc<watch::Sender<SessionState>>,
    demand: mpsc::Sender<Waiter>,
    liveness: watch::Receiver<bool>,
}

impl PullIterator {
    /// Start pulling from `consumer`. Must be called within a Tokio runtime.
    pub fn start(
        broker: Arc<dyn Broker>,
        consumer: ConsumerHandle,
        options: PullOptions,
        metrics: QueueMetrics,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Active);
        let state = Arc::new(state);
        let (demand, demand_rx) = mpsc::channel(64);
        let monitor = HeartbeatMonitor::new(options.heartbeat);
        let liveness = monitor.subscribe();

        let pump = Pump {
            broker,
            consumer,
            options,
            metrics,
            state: state.clone(),
            demand: demand_rx,
            waiters: VecDeque::new(),
            buffer: VecDeque::new(),
            response: None,
            drain_issued: false,
            monitor,
        };
        tokio::spawn(pump.run());

        Self {
            state,
            demand,
            liveness,
        }
    }

    /// Wait for the next message.
    ///
    /// Safe to call concurrently; each call claims at most one message.
    /// Fails with `IteratorClosed` once the session is stopped, and with
    /// `MissingHeartbeat` when heartbeats stop under a failing policy.
    pub async fn fetch_next(&self) -> Result<Message, QueueError> {
        let mut state = self.state.subscribe();
        if *state.borrow_and_update() == SessionState::Stopped {
            return Err(QueueError::IteratorClosed);
        }

        // The demand queue can be full while the pump is busy
        let permit = tokio::select! {
            biased;
            _ = stopped(&mut state) => return Err(QueueError::IteratorClosed),
            permit = self.demand.reserve() => permit.map_err(|_| QueueError::IteratorClosed)?,
        };
        let (tx, mut rx) = oneshot::channel();
        permit.send(tx);

        tokio::select! {
            biased;
            result = &mut rx => result.unwrap_or(Err(QueueError::IteratorClosed)),
            _ = stopped(&mut state) => rx.try_recv().unwrap_or(Err(QueueError::IteratorClosed)),
        }
    }

    /// Stop immediately. Messages not yet handed out are left to the broker
    /// for redelivery. Returns whether this call changed the state.
    pub fn stop(&self) -> bool {
        let changed = advance(&self.state, SessionState::Stopped);
        if changed {
            info!("Pull iterator stopped");
        }
        changed
    }

    /// Stop issuing pull requests and hand out what is already in transit.
    /// The session reaches `Stopped` on its own once nothing is left.
    pub fn drain(&self) -> bool {
        let changed = advance(&self.state, SessionState::Draining);
        if changed {
            info!("Pull iterator draining");
        }
        changed
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// `false` while heartbeats are missing.
    pub fn liveness(&self) -> watch::Receiver<bool> {
        self.liveness.clone()
    }

    /// Resolve once the session is `Stopped`.
    pub async fn closed(&self) {
        stopped(&mut self.state.subscribe()).await;
    }
}

impl Drop for PullIterator {
    fn drop(&mut self) {
        advance(&self.state, SessionState::Stopped);
    }
}

/// Background task owning the open pull request.
struct Pump {
    broker: Arc<dyn Broker>,
    consumer: ConsumerHandle,
    options: PullOptions,
    metrics: QueueMetrics,
    state: Arc<watch::Sender<SessionState>>,
    demand: mpsc::Receiver<Waiter>,
    waiters: VecDeque<Waiter>,
    buffer: VecDeque<Message>,
    response: Option<Box<dyn PullResponse>>,
    drain_issued: bool,
    monitor: HeartbeatMonitor,
}

enum Wake {
    State,
    Demand(Option<Waiter>),
    Event(Option<Result<PullEvent, QueueError>>),
    HeartbeatDue,
}

impl Pump {
    async fn run(mut self) {
        let mut state_rx = self.state.subscribe();

        loop {
            let state = *state_rx.borrow_and_update();
            if state == SessionState::Stopped {
                break;
            }

            if state == SessionState::Draining && !self.drain_issued {
                self.drain_issued = true;
                if let Some(response) = self.response.as_mut() {
                    if let Err(e) = response.drain().await {
                        warn!(error = %e, "Failed to drain pull request");
                        self.response = None;
                    }
                }
            }

            self.hand_out();

            if state == SessionState::Draining && self.response.is_none() && self.buffer.is_empty() {
                debug!("Drain complete");
                advance(&self.state, SessionState::Stopped);
                break;
            }

            if state == SessionState::Active && self.response.is_none() && !self.waiters.is_empty() {
                self.open_pull().await;
                continue;
            }

            let heartbeat_due = match (&self.response, state) {
                (Some(_), SessionState::Active) => self.monitor.deadline(),
                _ => None,
            };

            let wake = {
                let response = self.response.as_mut();
                tokio::select! {
                    biased;
                    _ = state_rx.changed() => Wake::State,
                    waiter = self.demand.recv() => Wake::Demand(waiter),
                    event = next_event(response) => Wake::Event(event),
                    _ = sleep_or_pending(heartbeat_due) => Wake::HeartbeatDue,
                }
            };

            match wake {
                Wake::State => {}
                Wake::Demand(Some(waiter)) => self.waiters.push_back(waiter),
                // Every iterator handle is gone
                Wake::Demand(None) => break,
                Wake::Event(event) => self.on_event(event),
                Wake::HeartbeatDue => self.on_heartbeat_due(),
            }
        }

        if !self.buffer.is_empty() {
            debug!(
                count = self.buffer.len(),
                "Releasing undelivered messages to broker redelivery"
            );
        }
        // Dropping the waiters fails their fetches with IteratorClosed
        self.waiters.clear();
    }

    /// Pair buffered messages with waiting callers.
    fn hand_out(&mut self) {
        self.waiters.retain(|w| !w.is_closed());

        while !self.buffer.is_empty() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let Some(message) = self.buffer.pop_front() else {
                break;
            };
            if let Err(Ok(message)) = waiter.send(Ok(message)) {
                // Caller went away before taking it
                self.buffer.push_front(message);
            }
        }
    }

    fn fail_next_waiter(&mut self, error: QueueError) {
        self.waiters.retain(|w| !w.is_closed());
        match self.waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(Err(error));
            }
            None => debug!(error = %error, "Pull error with no waiting fetch"),
        }
    }

    async fn open_pull(&mut self) {
        let request = PullRequest {
            batch: self.options.batch,
            expires: self.options.expires,
            idle_heartbeat: self.options.heartbeat.interval,
        };

        match self.broker.pull(&self.consumer, request).await {
            Ok(response) => {
                debug!(consumer = %self.consumer.name(), batch = request.batch, "Pull request issued");
                self.monitor.reset();
                self.response = Some(response);
            }
            Err(e) => {
                warn!(error = %e, consumer = %self.consumer.name(), "Pull request failed");
                self.fail_next_waiter(e);
            }
        }
    }

    fn on_event(&mut self, event: Option<Result<PullEvent, QueueError>>) {
        match event {
            Some(Ok(PullEvent::Message(message))) => {
                self.monitor.record();
                self.buffer.push_back(message);
            }
            Some(Ok(PullEvent::Heartbeat)) => {
                self.monitor.record();
            }
            Some(Err(e)) => {
                self.response = None;
                self.fail_next_waiter(e);
            }
            None => {
                self.response = None;
            }
        }
    }

    fn on_heartbeat_due(&mut self) {
        let Err(e) = self.monitor.check(Instant::now()) else {
            return;
        };

        self.metrics.heartbeat_missed();
        warn!(error = %e, consumer = %self.consumer.name(), "Heartbeat missed, re-issuing pull request");
        self.response = None;

        if self.monitor.fails_fetch() {
            self.fail_next_waiter(e);
        }
    }
}

async fn next_event(response: Option<&mut Box<dyn PullResponse>>) -> Option<Result<PullEvent, QueueError>> {
    match response {
        Some(response) => response.next_event().await,
        None => pending().await,
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
