//! Configuration for streams, consumers and workers.

use crate::error::QueueError;
use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Stream configuration trait (type-safe constants).
///
/// # Example
///
/// ```rust,ignore
/// struct JobsStream;
///
/// impl StreamConfig for JobsStream {
///     const STREAM_NAME: &'static str = "jobs";
///     const SUBJECTS: &'static [&'static str] = &["jobs.>"];
///     const CONSUMER_NAME: &'static str = "JobsConsumer";
/// }
/// ```
pub trait StreamConfig {
    /// JetStream stream name (e.g., "jobs")
    const STREAM_NAME: &'static str;

    /// Subjects captured by the stream (e.g., "jobs.>")
    const SUBJECTS: &'static [&'static str];

    /// Durable consumer name (e.g., "JobsConsumer")
    const CONSUMER_NAME: &'static str;

    /// Filter subjects of the consumer (empty = all subjects)
    const FILTER_SUBJECTS: &'static [&'static str] = &[];

    /// Maximum deliveries per sequence (0 = unbounded)
    const MAX_DELIVER: u64 = 0;

    /// Ack wait timeout in seconds (default: 5 minutes)
    const ACK_WAIT_SECS: u64 = 300;
}

/// Stream retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Keep messages until limits are hit.
    Limits,
    /// Remove a message once it has been acknowledged; filters must not overlap.
    #[default]
    WorkQueue,
    /// Keep messages while consumers are interested.
    Interest,
}

/// Stream the consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: Retention,
}

impl StreamDescriptor {
    /// Work-queue stream over the given subjects.
    pub fn work_queue(name: impl Into<String>, subjects: &[&str]) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            retention: Retention::WorkQueue,
        }
    }

    /// Set the retention policy.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
}

/// Acknowledgment policy. Only explicit acks are supported by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    #[default]
    Explicit,
    All,
    None,
}

/// Durable consumer identity and delivery policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    /// Durable name surviving process restarts.
    pub name: String,
    /// Subject filters; empty means all subjects of the stream.
    pub filter_subjects: Vec<String>,
    pub ack_policy: AckPolicy,
    /// Time before an unacknowledged delivery becomes eligible for redelivery.
    pub ack_wait: Duration,
    /// Maximum delivery attempts per sequence; `None` is unbounded.
    pub max_deliver: Option<u64>,
}

impl ConsumerDescriptor {
    /// Durable consumer with explicit acks and no filter.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subjects: Vec::new(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: None,
        }
    }

    /// Restrict the consumer to a single filter subject.
    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subjects = vec![subject.into()];
        self
    }

    /// Restrict the consumer to several filter subjects.
    pub fn with_filter_subjects<S: Into<String>>(mut self, subjects: impl IntoIterator<Item = S>) -> Self {
        self.filter_subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    /// Set the ack wait.
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    /// Bound delivery attempts.
    pub fn with_max_deliver(mut self, max_deliver: u64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    /// Whether the consumer receives every subject of the stream.
    pub fn is_unfiltered(&self) -> bool {
        self.filter_subjects.is_empty()
    }

    /// Check the descriptor before sending it to the broker.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.is_empty() {
            return Err(QueueError::config("consumer name must not be empty"));
        }
        if self.name.contains(['.', '*', '>', ' ']) {
            return Err(QueueError::config(format!(
                "consumer name '{}' contains reserved characters",
                self.name
            )));
        }
        if self.ack_policy != AckPolicy::Explicit {
            return Err(QueueError::config("only explicit ack policy is supported"));
        }
        if self.filter_subjects.iter().any(|s| s.is_empty()) {
            return Err(QueueError::config("filter subjects must not be empty strings"));
        }
        if self.max_deliver == Some(0) {
            return Err(QueueError::config("max_deliver must be at least 1 when set"));
        }
        if self.ack_wait.is_zero() {
            return Err(QueueError::config("ack_wait must be positive"));
        }
        Ok(())
    }
}

/// What `fetch_next()` does once heartbeats stop arriving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnMissingHeartbeat {
    /// Fail the pending fetch with `MissingHeartbeat`.
    #[default]
    Fail,
    /// Keep waiting; liveness loss is only logged.
    Block,
}

/// Idle heartbeat settings for pull requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Cadence requested from the broker; `None` disables liveness detection.
    pub interval: Option<Duration>,
    pub on_missing: OnMissingHeartbeat,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Some(Duration::from_secs(15)),
            on_missing: OnMissingHeartbeat::Fail,
        }
    }
}

impl HeartbeatPolicy {
    /// Heartbeats every `interval`, failing fetches when they stop.
    pub fn fail_after(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            on_missing: OnMissingHeartbeat::Fail,
        }
    }

    /// Heartbeats every `interval`, blocking through missing ones.
    pub fn block_after(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            on_missing: OnMissingHeartbeat::Block,
        }
    }

    /// No heartbeats requested.
    pub fn disabled() -> Self {
        Self {
            interval: None,
            on_missing: OnMissingHeartbeat::Block,
        }
    }
}

/// How fetched messages reach handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    /// One loop fetches and submits a task per message through the admission gate.
    #[default]
    PullThenDispatch,
    /// N long-lived loops, each fetch → handle → ack.
    PullPerWorker,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stream to ensure before consuming
    pub stream: StreamDescriptor,

    /// Durable consumer to create or update
    pub consumer: ConsumerDescriptor,

    /// Maximum concurrently running handlers
    pub parallelism: usize,

    /// Dispatch topology
    pub topology: Topology,

    /// Messages requested per pull
    pub batch_size: usize,

    /// Lifetime of a single pull request
    pub pull_expires: Duration,

    /// Idle heartbeat policy
    pub heartbeat: HeartbeatPolicy,

    /// Bound on a single ack/nak round-trip (distinct from `ack_wait`)
    pub ack_timeout: Duration,

    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace: Duration,

    /// Pause after a failed fetch before trying again
    pub error_backoff: Duration,

    /// Health server port
    pub health_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream: StreamDescriptor::work_queue("jobs", &["jobs.>"]),
            consumer: ConsumerDescriptor::durable("JobsConsumer")
                .with_ack_wait(Duration::from_secs(300)),
            parallelism: 5,
            topology: Topology::PullThenDispatch,
            batch_size: 1,
            pull_expires: Duration::from_secs(30),
            heartbeat: HeartbeatPolicy::default(),
            ack_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            error_backoff: Duration::from_secs(1),
            health_port: 8081,
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration for a stream and durable consumer.
    pub fn new(stream: StreamDescriptor, consumer: ConsumerDescriptor) -> Self {
        Self {
            stream,
            consumer,
            ..Default::default()
        }
    }

    /// Create from a StreamConfig trait.
    pub fn from_stream<S: StreamConfig>() -> Self {
        let mut consumer = ConsumerDescriptor::durable(S::CONSUMER_NAME)
            .with_filter_subjects(S::FILTER_SUBJECTS.iter().copied())
            .with_ack_wait(Duration::from_secs(S::ACK_WAIT_SECS));
        if S::MAX_DELIVER > 0 {
            consumer = consumer.with_max_deliver(S::MAX_DELIVER);
        }

        Self {
            stream: StreamDescriptor::work_queue(S::STREAM_NAME, S::SUBJECTS),
            consumer,
            ..Default::default()
        }
    }

    /// Set the parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the dispatch topology.
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Set the pull batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the pull request expiry.
    pub fn with_pull_expires(mut self, expires: Duration) -> Self {
        self.pull_expires = expires;
        self
    }

    /// Set the heartbeat policy.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatPolicy) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the ack round-trip timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the backoff after fetch errors.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Set the health server port.
    pub fn with_health_port(mut self, port: u16) -> Self {
        self.health_port = port;
        self
    }

    /// Check the configuration before talking to the broker.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.stream.name.is_empty() {
            return Err(QueueError::config("stream name must not be empty"));
        }
        self.consumer.validate()?;
        if self.parallelism == 0 {
            return Err(QueueError::config("parallelism must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(QueueError::config("batch size must be at least 1"));
        }
        if self.pull_expires.is_zero() {
            return Err(QueueError::config("pull expiry must be positive"));
        }
        if let Some(interval) = self.heartbeat.interval {
            if interval.is_zero() {
                return Err(QueueError::config("heartbeat interval must be positive"));
            }
            if self.pull_expires <= interval * 2 {
                return Err(QueueError::config(format!(
                    "pull expiry {:?} must exceed twice the heartbeat interval {:?}",
                    self.pull_expires, interval
                )));
            }
        }
        if self.ack_timeout.is_zero() {
            return Err(QueueError::config("ack timeout must be positive"));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromEnv for WorkerConfig {
    /// Every variable is optional; defaults match `WorkerConfig::default()`.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = WorkerConfig::default();

        let stream = StreamDescriptor {
            name: env_or_default("WORKQUEUE_STREAM", &defaults.stream.name),
            subjects: split_list(&env_or_default("WORKQUEUE_SUBJECTS", "jobs.>")),
            retention: Retention::WorkQueue,
        };

        let max_deliver: u64 = env_parse("WORKQUEUE_MAX_DELIVER", 0)?;
        let consumer = ConsumerDescriptor {
            name: env_or_default("WORKQUEUE_CONSUMER", &defaults.consumer.name),
            filter_subjects: split_list(&env_or_default("WORKQUEUE_FILTER_SUBJECTS", "")),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(env_parse(
                "WORKQUEUE_ACK_WAIT_SECS",
                defaults.consumer.ack_wait.as_secs(),
            )?),
            max_deliver: (max_deliver > 0).then_some(max_deliver),
        };

        let heartbeat_secs: u64 = env_parse("WORKQUEUE_HEARTBEAT_SECS", 15)?;
        let fail_on_missing: bool = env_parse("WORKQUEUE_HEARTBEAT_ERR", true)?;
        let heartbeat = match (heartbeat_secs, fail_on_missing) {
            (0, _) => HeartbeatPolicy::disabled(),
            (secs, true) => HeartbeatPolicy::fail_after(Duration::from_secs(secs)),
            (secs, false) => HeartbeatPolicy::block_after(Duration::from_secs(secs)),
        };

        let topology = match env_or_default("WORKQUEUE_TOPOLOGY", "dispatch").as_str() {
            "dispatch" => Topology::PullThenDispatch,
            "per-worker" => Topology::PullPerWorker,
            other => {
                return Err(ConfigError::ParseError {
                    key: "WORKQUEUE_TOPOLOGY".to_string(),
                    details: format!("expected 'dispatch' or 'per-worker', got '{other}'"),
                })
            }
        };

        Ok(Self {
            stream,
            consumer,
            parallelism: env_parse("WORKQUEUE_PARALLELISM", defaults.parallelism)?,
            topology,
            batch_size: env_parse("WORKQUEUE_BATCH_SIZE", defaults.batch_size)?,
            heartbeat,
            shutdown_grace: Duration::from_secs(env_parse(
                "WORKQUEUE_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            health_port: env_parse("HEALTH_PORT", defaults.health_port)?,
            ..defaults
        })
    }
}
