//! Durable work-queue consumption core.
//!
//! Pulls messages from a durable consumer, runs a bounded number of
//! handlers concurrently, acknowledges each delivery, and shuts down in an
//! orderly way on request.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ fetch_next ┌──────────────┐ submit ┌────────────┐
//! │ PullIterator │───────────▶│ dispatch loop│───────▶│ WorkerPool │
//! │ + heartbeat  │            └──────────────┘        │  (N slots) │
//! └──────┬───────┘                                    └─────┬──────┘
//!        │ stop / drain                                     │ handle
//! ┌──────┴─────────────┐        join_all          ┌─────────▼──────┐
//! │ ShutdownController │◀─────────────────────────│ AckController  │
//! └────────────────────┘                          │ ack / nak/term │
//!                                                 └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use workqueue::{handler_fn, JetStreamBroker, QueueWorker, WorkerConfig};
//!
//! let broker = Arc::new(JetStreamBroker::connect(&NatsConfig::from_env()?).await?);
//! let worker = QueueWorker::new(broker, WorkerConfig::default()).await?;
//!
//! let handle = worker.run(handler_fn("print", |message: Message| async move {
//!     println!("{}", String::from_utf8_lossy(&message.payload));
//!     Ok(())
//! }));
//!
//! handle.drain();
//! let outcome = handle.wait().await;
//! ```

pub mod ack;
pub mod broker;
pub mod config;
pub mod error;
pub mod handler;
pub mod health;
pub mod heartbeat;
pub mod iterator;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod producer;
pub mod shutdown;
pub mod subject;
pub mod worker;

pub use ack::AckController;
pub use broker::{Broker, ConsumerHandle, JetStreamBroker, MemoryBroker, PullEvent, PullRequest, PullResponse};
pub use config::{
    AckPolicy, ConsumerDescriptor, HeartbeatPolicy, OnMissingHeartbeat, Retention, StreamConfig, StreamDescriptor,
    Topology, WorkerConfig,
};
pub use error::{FaultCategory, ProcessingError, QueueError};
pub use handler::{handler_fn, FnHandler, Handler};
pub use health::{HealthServer, HealthState, HealthStatus};
pub use heartbeat::HeartbeatMonitor;
pub use iterator::{PullIterator, PullOptions, SessionState};
pub use message::{AckReply, Message};
pub use crate::metrics::{init_metrics, QueueMetrics};
pub use pool::WorkerPool;
pub use producer::JobProducer;
pub use shutdown::{ControllerState, ShutdownController, ShutdownMode, ShutdownOutcome};
pub use worker::{QueueWorker, WorkerHandle};

// Re-export for handler implementations
pub use async_trait::async_trait;
