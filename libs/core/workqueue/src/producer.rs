//! Publishing jobs onto the stream.

use crate::broker::Broker;
use crate::error::QueueError;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Publishes payloads through the broker.
#[derive(Clone)]
pub struct JobProducer {
    broker: Arc<dyn Broker>,
}

impl JobProducer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish a raw payload.
    ///
    /// Returns the stream sequence of the stored message.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<u64, QueueError> {
        let sequence = self.broker.publish(subject, payload.into()).await?;
        debug!(subject = %subject, sequence, "Published job");
        Ok(sequence)
    }

    /// Publish `value` serialized as JSON.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<u64, QueueError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(subject, payload).await
    }
}
