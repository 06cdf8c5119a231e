//! Liveness tracking for an open pull session.

use crate::config::{HeartbeatPolicy, OnMissingHeartbeat};
use crate::error::QueueError;
use tokio::sync::watch;
use tokio::time::Instant;

/// Heartbeats that may go missing before the session is declared dead.
const MISSED_HEARTBEATS: u32 = 2;

/// Watches for idle heartbeats and messages on the current pull request.
///
/// Any message or heartbeat counts as a liveness signal. Silence longer
/// than twice the requested cadence marks the session dead until the next
/// signal. The monitor never stops the session itself.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    policy: HeartbeatPolicy,
    last_signal: Instant,
    live: watch::Sender<bool>,
}

impl HeartbeatMonitor {
    pub fn new(policy: HeartbeatPolicy) -> Self {
        let (live, _) = watch::channel(true);
        Self {
            policy,
            last_signal: Instant::now(),
            live,
        }
    }

    pub fn policy(&self) -> HeartbeatPolicy {
        self.policy
    }

    /// Whether a missing heartbeat should fail the pending fetch.
    pub fn fails_fetch(&self) -> bool {
        self.policy.on_missing == OnMissingHeartbeat::Fail
    }

    /// Observe liveness transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.live.subscribe()
    }

    pub fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Record a heartbeat or message.
    pub fn record(&mut self) {
        self.last_signal = Instant::now();
        self.live.send_if_modified(|live| !std::mem::replace(live, true));
    }

    /// Restart the window for a freshly issued pull request.
    pub fn reset(&mut self) {
        self.last_signal = Instant::now();
    }

    /// Instant after which the session counts as dead, if monitoring is on.
    pub fn deadline(&self) -> Option<Instant> {
        self.policy
            .interval
            .map(|interval| self.last_signal + interval * MISSED_HEARTBEATS)
    }

    /// Declare the session dead if the deadline has passed.
    pub fn check(&mut self, now: Instant) -> Result<(), QueueError> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.live.send_if_modified(|live| std::mem::replace(live, false));
                let missed_for = now.duration_since(self.last_signal);
                Err(QueueError::MissingHeartbeat {
                    missed_for_ms: u64::try_from(missed_for.as_millis()).unwrap_or(u64::MAX),
                })
            }
            _ => Ok(()),
        }
    }
}
