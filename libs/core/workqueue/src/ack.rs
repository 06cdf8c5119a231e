//! Acknowledgment of handled messages.

use crate::broker::Broker;
use crate::error::QueueError;
use crate::message::Message;
use crate::metrics::QueueMetrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends ack, nak and term for deliveries.
///
/// Each round-trip is bounded by `ack_timeout`, which is independent of the
/// consumer's `ack_wait`. Failed acks are not retried: the broker redelivers
/// the message after `ack_wait`, so handlers must be idempotent.
#[derive(Clone)]
pub struct AckController {
    broker: Arc<dyn Broker>,
    ack_timeout: Duration,
    max_deliver: Option<u64>,
    metrics: QueueMetrics,
}

impl AckController {
    pub fn new(
        broker: Arc<dyn Broker>,
        ack_timeout: Duration,
        max_deliver: Option<u64>,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            broker,
            ack_timeout,
            max_deliver,
            metrics,
        }
    }

    /// Whether the broker will not offer this message again after a nak.
    pub fn is_last_delivery(&self, message: &Message) -> bool {
        self.max_deliver
            .is_some_and(|max| message.delivery_count >= max)
    }

    /// Positive acknowledgment; the broker removes the message from the
    /// work queue.
    pub async fn acknowledge(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, "ack", self.broker.ack(message)).await?;
        self.metrics.acked();
        debug!(sequence = message.sequence, "Message acknowledged");
        Ok(())
    }

    /// Negative acknowledgment; redelivery is scheduled immediately unless
    /// the delivery bound is reached.
    pub async fn negative_acknowledge(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, "nak", self.broker.nak(message)).await?;
        self.metrics.nacked();
        if self.is_last_delivery(message) {
            warn!(
                sequence = message.sequence,
                delivery_count = message.delivery_count,
                "Delivery attempts exhausted, message will not be redelivered"
            );
        } else {
            debug!(sequence = message.sequence, "Message negatively acknowledged");
        }
        Ok(())
    }

    /// Terminate: the broker stops redelivering this sequence.
    pub async fn terminate(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, "term", self.broker.term(message)).await?;
        self.metrics.terminated();
        debug!(sequence = message.sequence, "Message terminated");
        Ok(())
    }

    async fn settle<F>(&self, message: &Message, kind: &'static str, op: F) -> Result<(), QueueError>
    where
        F: Future<Output = Result<(), QueueError>>,
    {
        if message.is_expired() {
            self.metrics.ack_failed(kind);
            return Err(QueueError::AckDeadlineExceeded {
                sequence: message.sequence,
            });
        }

        let result = match tokio::time::timeout(self.ack_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(format!(
                "{kind} of sequence {} exceeded {:?}",
                message.sequence, self.ack_timeout
            ))),
        };

        if result.is_err() {
            self.metrics.ack_failed(kind);
        }
        result
    }
}
