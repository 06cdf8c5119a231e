//! NATS JetStream implementation of the broker seam.

use super::{Broker, ConsumerHandle, PullEvent, PullRequest, PullResponse};
use crate::config::{ConsumerDescriptor, Retention, StreamDescriptor};
use crate::error::QueueError;
use crate::message::{Message, Receipt};
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{Config as NatsStreamConfig, RetentionPolicy};
use async_nats::jetstream::{AckKind, Context};
use async_nats::{Client, StatusCode, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use core_config::NatsConfig;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Broker backed by a NATS server with JetStream enabled.
///
/// Pull requests are issued on the raw `$JS.API.CONSUMER.MSG.NEXT` API so
/// that draining can stop the request without losing messages that are
/// already on the wire.
#[derive(Clone)]
pub struct JetStreamBroker {
    client: Client,
    jetstream: Context,
}

impl JetStreamBroker {
    /// Connect to NATS using the given settings.
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        info!(url = %config.url, name = %config.name, "Connecting to NATS");
        let client = async_nats::ConnectOptions::new()
            .name(&config.name)
            .connect(&config.url)
            .await?;
        Ok(Self::from_client(client))
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        let jetstream = async_nats::jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn settle(&self, message: &Message, kind: AckKind) -> Result<(), QueueError> {
        let delivery = delivery(message)?;
        delivery.ack_with(kind).await.map_err(QueueError::broker)?;
        self.client.flush().await.map_err(QueueError::broker)
    }
}

/// The JetStream delivery behind a message.
fn delivery(message: &Message) -> Result<&async_nats::jetstream::Message, QueueError> {
    match &message.receipt {
        Receipt::JetStream(delivery) => Ok(delivery),
        Receipt::Reply(_) => Err(QueueError::broker(format!(
            "sequence {} was not delivered by JetStream",
            message.sequence
        ))),
    }
}

fn is_timeout(error: &async_nats::Error) -> bool {
    error
        .downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::TimedOut)
}

/// Map a consumer creation failure, recognising the work-queue uniqueness
/// rejections by their server description.
fn consumer_error(stream: &str, consumer: &str, error: impl std::fmt::Display) -> QueueError {
    let details = error.to_string();
    let lower = details.to_lowercase();

    if lower.contains("filtered consumer not unique")
        || lower.contains("multiple non-filtered consumers not allowed")
        || lower.contains("overlap")
    {
        QueueError::FilterOverlap {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            details,
        }
    } else if lower.contains("stream not found") {
        QueueError::StreamNotFound(stream.to_string())
    } else {
        QueueError::Broker(details)
    }
}

fn retention_policy(retention: Retention) -> RetentionPolicy {
    match retention {
        Retention::Limits => RetentionPolicy::Limits,
        Retention::WorkQueue => RetentionPolicy::WorkQueue,
        Retention::Interest => RetentionPolicy::Interest,
    }
}

/// Body of a `CONSUMER.MSG.NEXT` request. Durations are nanoseconds.
#[derive(Debug, Serialize)]
struct NextRequest {
    batch: usize,
    expires: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    idle_heartbeat: Option<u64>,
}

impl From<PullRequest> for NextRequest {
    fn from(request: PullRequest) -> Self {
        let nanos = |d: Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        Self {
            batch: request.batch,
            expires: nanos(request.expires),
            idle_heartbeat: request.idle_heartbeat.map(nanos),
        }
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn ensure_stream(&self, stream: &StreamDescriptor) -> Result<(), QueueError> {
        let mut handle = self
            .jetstream
            .get_or_create_stream(NatsStreamConfig {
                name: stream.name.clone(),
                subjects: stream.subjects.clone(),
                retention: retention_policy(stream.retention),
                ..Default::default()
            })
            .await
            .map_err(QueueError::broker)?;

        let info = handle.info().await.map_err(QueueError::broker)?;
        if info.config.retention != retention_policy(stream.retention) {
            warn!(
                stream = %stream.name,
                existing = ?info.config.retention,
                "Stream exists with a different retention policy"
            );
        }
        debug!(
            stream = %stream.name,
            messages = info.state.messages,
            consumers = info.state.consumer_count,
            "Stream ready"
        );
        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
    ) -> Result<ConsumerHandle, QueueError> {
        descriptor.validate()?;

        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| consumer_error(stream, &descriptor.name, e))?;

        let (filter_subject, filter_subjects) = match descriptor.filter_subjects.as_slice() {
            [] => (String::new(), Vec::new()),
            [single] => (single.clone(), Vec::new()),
            many => (String::new(), many.to_vec()),
        };

        info!(
            consumer = %descriptor.name,
            stream = %stream,
            filters = ?descriptor.filter_subjects,
            "Creating or updating consumer"
        );

        handle
            .create_consumer(PullConfig {
                durable_name: Some(descriptor.name.clone()),
                name: Some(descriptor.name.clone()),
                ack_policy: AckPolicy::Explicit,
                ack_wait: descriptor.ack_wait,
                max_deliver: descriptor
                    .max_deliver
                    .map(|m| i64::try_from(m).unwrap_or(i64::MAX))
                    .unwrap_or(-1),
                filter_subject,
                filter_subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| consumer_error(stream, &descriptor.name, e))?;

        Ok(ConsumerHandle {
            stream: stream.to_string(),
            descriptor: descriptor.clone(),
        })
    }

    async fn pull(
        &self,
        consumer: &ConsumerHandle,
        request: PullRequest,
    ) -> Result<Box<dyn PullResponse>, QueueError> {
        let inbox = self.client.new_inbox();
        let subscriber = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(QueueError::broker)?;

        let subject = format!(
            "$JS.API.CONSUMER.MSG.NEXT.{}.{}",
            consumer.stream,
            consumer.name()
        );
        let body = serde_json::to_vec(&NextRequest::from(request))?;
        self.client
            .publish_with_reply(subject, inbox, body.into())
            .await
            .map_err(QueueError::broker)?;

        Ok(Box::new(JetStreamPull {
            subscriber,
            context: self.jetstream.clone(),
            ack_wait: consumer.descriptor.ack_wait,
            remaining: request.batch,
            finished: false,
        }))
    }

    async fn ack(&self, message: &Message) -> Result<(), QueueError> {
        // Double ack: the server confirms before this returns
        delivery(message)?.double_ack().await.map_err(|e| {
            if is_timeout(&e) {
                QueueError::Timeout(format!("ack of sequence {}", message.sequence))
            } else {
                QueueError::broker(e)
            }
        })
    }

    async fn nak(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, AckKind::Nak(None)).await
    }

    async fn term(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, AckKind::Term).await
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, QueueError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(QueueError::broker)?
            .await
            .map_err(QueueError::broker)?;
        Ok(ack.sequence)
    }
}

/// Responses to one pull request, read from its private inbox.
struct JetStreamPull {
    subscriber: Subscriber,
    context: Context,
    ack_wait: Duration,
    remaining: usize,
    finished: bool,
}

#[async_trait]
impl PullResponse for JetStreamPull {
    async fn next_event(&mut self) -> Option<Result<PullEvent, QueueError>> {
        if self.finished {
            return None;
        }

        let Some(msg) = self.subscriber.next().await else {
            self.finished = true;
            return None;
        };

        if let Some(status) = msg.status {
            if status == StatusCode::IDLE_HEARTBEAT {
                return Some(Ok(PullEvent::Heartbeat));
            }
            if status == StatusCode::NOT_FOUND
                || status == StatusCode::TIMEOUT
                || status == StatusCode::REQUEST_TERMINATED
            {
                debug!(%status, description = ?msg.description, "Pull request ended");
                self.finished = true;
                return None;
            }
            if status != StatusCode::OK {
                self.finished = true;
                return Some(Err(QueueError::Broker(format!(
                    "pull request failed with status {status}: {}",
                    msg.description.unwrap_or_default()
                ))));
            }
        }

        if msg.reply.is_none() {
            self.finished = true;
            return Some(Err(QueueError::broker("delivery without ack subject")));
        }

        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.finished = true;
        }

        let delivery = async_nats::jetstream::Message {
            message: msg,
            context: self.context.clone(),
        };
        Some(Message::from_jetstream(delivery, Instant::now() + self.ack_wait).map(PullEvent::Message))
    }

    async fn drain(&mut self) -> Result<(), QueueError> {
        self.subscriber.drain().await.map_err(QueueError::broker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_request_body() {
        let body = NextRequest::from(PullRequest {
            batch: 5,
            expires: Duration::from_secs(30),
            idle_heartbeat: Some(Duration::from_secs(15)),
        });
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["batch"], 5);
        assert_eq!(json["expires"], 30_000_000_000u64);
        assert_eq!(json["idle_heartbeat"], 15_000_000_000u64);

        let body = NextRequest::from(PullRequest {
            batch: 1,
            expires: Duration::from_secs(1),
            idle_heartbeat: None,
        });
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("idle_heartbeat"));
    }

    #[tokio::test]
    async fn test_only_jetstream_deliveries_settle() {
        let message = Message::from_delivery(
            "jobs.info",
            Bytes::from_static(b"x"),
            "$JS.ACK.jobs.c1.1.4.4.0.0",
            Instant::now() + Duration::from_secs(30),
        )
        .unwrap();
        assert!(matches!(delivery(&message), Err(QueueError::Broker(_))));
    }

    #[test]
    fn test_double_ack_timeout_detection() {
        let timed_out: async_nats::Error =
            Box::new(std::io::Error::new(std::io::ErrorKind::TimedOut, "double ack response timed out"));
        assert!(is_timeout(&timed_out));

        let other: async_nats::Error = Box::new(std::io::Error::other("subscription dropped"));
        assert!(!is_timeout(&other));
    }

    #[test]
    fn test_consumer_error_mapping() {
        let err = consumer_error(
            "TEST",
            "c3",
            "jetstream error: filtered consumer not unique on workqueue stream (error code 10100)",
        );
        assert!(matches!(err, QueueError::FilterOverlap { .. }));

        let err = consumer_error("TEST", "c2", "multiple non-filtered consumers not allowed on workqueue stream");
        assert!(matches!(err, QueueError::FilterOverlap { .. }));

        let err = consumer_error("MISSING", "c", "stream not found");
        assert!(matches!(err, QueueError::StreamNotFound(_)));

        let err = consumer_error("TEST", "c", "request timed out");
        assert!(matches!(err, QueueError::Broker(_)));
    }
}
