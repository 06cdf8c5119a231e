//! Error types for the consumption core.

use std::fmt;
use thiserror::Error;

/// Fault classes that decide how a caller reacts to a [`QueueError`].
///
/// # Categories
///
/// - **Configuration**: fatal at startup, surfaced to the caller, never retried
/// - **Transient**: a network round-trip failed, the caller may retry idempotent operations
/// - **Liveness**: heartbeats went missing, the caller decides whether to reconnect
/// - **Terminal**: the iterator is closed, the normal end-of-life signal after shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCategory {
    Configuration,
    Transient,
    Liveness,
    Terminal,
}

impl FaultCategory {
    /// Whether the dispatch loop should keep going after a fault of this class.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FaultCategory::Transient | FaultCategory::Liveness)
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCategory::Configuration => write!(f, "configuration"),
            FaultCategory::Transient => write!(f, "transient"),
            FaultCategory::Liveness => write!(f, "liveness"),
            FaultCategory::Terminal => write!(f, "terminal"),
        }
    }
}

/// Error that can occur in queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The pull iterator was stopped or finished draining.
    #[error("message iterator closed")]
    IteratorClosed,

    /// No heartbeat and no message arrived within the liveness window.
    #[error("missing heartbeat: no liveness signal for {missed_for_ms}ms")]
    MissingHeartbeat { missed_for_ms: u64 },

    /// The acknowledgment arrived after the delivery expired.
    #[error("ack deadline exceeded for sequence {sequence}")]
    AckDeadlineExceeded { sequence: u64 },

    /// The requested filter subjects intersect another durable consumer.
    #[error("consumer '{consumer}' filter overlaps an existing consumer on stream '{stream}': {details}")]
    FilterOverlap {
        stream: String,
        consumer: String,
        details: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// Broker round-trip failure (fetch, ack, nak, publish).
    #[error("broker error: {0}")]
    Broker(String),

    /// An operation exceeded its timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream not found
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Consumer not found
    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The worker pool no longer admits tasks.
    #[error("worker pool closed")]
    PoolClosed,

    /// A pool task panicked or was aborted before finishing.
    #[error("worker task aborted")]
    TaskAborted,
}

impl QueueError {
    /// Get the fault category for this error.
    pub fn category(&self) -> FaultCategory {
        match self {
            QueueError::IteratorClosed => FaultCategory::Terminal,
            QueueError::PoolClosed => FaultCategory::Terminal,
            QueueError::TaskAborted => FaultCategory::Terminal,

            QueueError::MissingHeartbeat { .. } => FaultCategory::Liveness,

            QueueError::FilterOverlap { .. } => FaultCategory::Configuration,
            QueueError::Config(_) => FaultCategory::Configuration,
            QueueError::StreamNotFound(_) => FaultCategory::Configuration,
            QueueError::ConsumerNotFound(_) => FaultCategory::Configuration,
            QueueError::Serialization(_) => FaultCategory::Configuration,

            // Stale acks are non-fatal: the message is redelivered anyway
            QueueError::AckDeadlineExceeded { .. } => FaultCategory::Transient,
            QueueError::Connection(_) => FaultCategory::Transient,
            QueueError::Broker(_) => FaultCategory::Transient,
            QueueError::Timeout(_) => FaultCategory::Transient,
        }
    }

    /// The sanctioned end-of-loop signal.
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::IteratorClosed)
    }

    /// Create a broker error from any displayable error.
    pub fn broker(error: impl fmt::Display) -> Self {
        Self::Broker(error.to_string())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Error returned by a [`Handler`](crate::Handler).
///
/// - `Transient`: the delivery is negatively acknowledged and redelivered
/// - `Permanent`: the delivery is terminated, the broker stops redelivering it
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Temporary failure (downstream timeout, service unavailable)
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unrecoverable failure (invalid payload, business rule violation)
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProcessingError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient error with a source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    /// Create a permanent error with a source.
    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the message should be offered again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Transient { .. })
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(error: serde_json::Error) -> Self {
        ProcessingError::permanent_with_source("payload could not be decoded", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(QueueError::IteratorClosed.category(), FaultCategory::Terminal);
        assert_eq!(
            QueueError::MissingHeartbeat { missed_for_ms: 10 }.category(),
            FaultCategory::Liveness
        );
        assert_eq!(
            QueueError::FilterOverlap {
                stream: "jobs".to_string(),
                consumer: "c2".to_string(),
                details: "overlap".to_string(),
            }
            .category(),
            FaultCategory::Configuration
        );
        assert_eq!(
            QueueError::broker("connection reset").category(),
            FaultCategory::Transient
        );
        assert_eq!(
            QueueError::AckDeadlineExceeded { sequence: 4 }.category(),
            FaultCategory::Transient
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(FaultCategory::Transient.is_recoverable());
        assert!(FaultCategory::Liveness.is_recoverable());
        assert!(!FaultCategory::Terminal.is_recoverable());
        assert!(!FaultCategory::Configuration.is_recoverable());
    }

    #[test]
    fn test_processing_error_retry() {
        assert!(ProcessingError::transient("timeout").is_retryable());
        assert!(!ProcessingError::permanent("invalid").is_retryable());

        let decode: ProcessingError = serde_json::from_str::<String>("{").unwrap_err().into();
        assert!(!decode.is_retryable());
    }
}
