//! The broker seam.
//!
//! The consumption core never talks to a transport directly. Everything it
//! needs from the durable queue goes through [`Broker`]:
//!
//! ```text
//! ┌──────────────┐  pull()   ┌──────────────────┐
//! │ PullIterator │──────────▶│                  │
//! └──────────────┘           │      Broker      │──▶ JetStreamBroker (async-nats)
//! ┌──────────────┐  ack/nak  │  (dyn, Arc'd)    │
//! │ AckController│──────────▶│                  │──▶ MemoryBroker (in-process)
//! └──────────────┘           └──────────────────┘
//! ```

mod jetstream;
mod memory;

pub use jetstream::JetStreamBroker;
pub use memory::MemoryBroker;

use crate::config::{ConsumerDescriptor, StreamDescriptor};
use crate::error::QueueError;
use crate::message::Message;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// A durable consumer the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub stream: String,
    pub descriptor: ConsumerDescriptor,
}

impl ConsumerHandle {
    /// Durable name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Delivery bound, if any.
    pub fn max_deliver(&self) -> Option<u64> {
        self.descriptor.max_deliver
    }
}

/// A single pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    /// Maximum messages to deliver for this request.
    pub batch: usize,
    /// Time after which the broker ends the request.
    pub expires: Duration,
    /// Idle heartbeat cadence while no message is available.
    pub idle_heartbeat: Option<Duration>,
}

/// What a pull response produces.
#[derive(Debug)]
pub enum PullEvent {
    Message(Message),
    Heartbeat,
}

/// The stream of events answering one [`PullRequest`].
#[async_trait]
pub trait PullResponse: Send {
    /// Next event, or `None` once the request is complete.
    async fn next_event(&mut self) -> Option<Result<PullEvent, QueueError>>;

    /// Stop waiting on the broker. Events that already arrived stay readable
    /// through `next_event`, after which the response ends.
    async fn drain(&mut self) -> Result<(), QueueError>;
}

/// Consumption primitives offered by the durable queue.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Get or create a stream.
    async fn ensure_stream(&self, stream: &StreamDescriptor) -> Result<(), QueueError>;

    /// Create a durable consumer or update it in place.
    ///
    /// Fails with [`QueueError::FilterOverlap`] when the filters intersect
    /// another durable consumer on a work-queue stream.
    async fn create_or_update_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
    ) -> Result<ConsumerHandle, QueueError>;

    /// Issue a pull request.
    async fn pull(
        &self,
        consumer: &ConsumerHandle,
        request: PullRequest,
    ) -> Result<Box<dyn PullResponse>, QueueError>;

    /// Positive acknowledgment of a delivery.
    async fn ack(&self, message: &Message) -> Result<(), QueueError>;

    /// Negative acknowledgment, redelivery is scheduled immediately.
    async fn nak(&self, message: &Message) -> Result<(), QueueError>;

    /// Stop redelivering this sequence.
    async fn term(&self, message: &Message) -> Result<(), QueueError>;

    /// Publish a payload, returning its stream sequence.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, QueueError>;
}
