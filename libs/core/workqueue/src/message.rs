//! Messages handed out by the pull iterator.

use crate::error::QueueError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use tokio::time::Instant;

const ACK_PREFIX: &str = "$JS.ACK";

/// How a delivery is settled with the broker that produced it.
#[derive(Clone)]
pub(crate) enum Receipt {
    /// Ack reply subject, settled by the in-process broker.
    Reply(String),
    /// A JetStream delivery, settled through its own ack API.
    JetStream(async_nats::jetstream::Message),
}

/// One unit of work fetched from the queue.
///
/// The core holds a `Message` only while its handler runs. Acknowledgment
/// goes through the receipt the broker attached to this delivery.
#[derive(Clone)]
pub struct Message {
    /// Stream sequence assigned by the broker.
    pub sequence: u64,
    /// Subject the message was published under.
    pub subject: String,
    /// Opaque payload.
    pub payload: Bytes,
    /// Delivery attempt for this sequence, starting at 1.
    pub delivery_count: u64,
    /// Acknowledge before this instant or the broker redelivers.
    pub ack_deadline: Instant,
    /// Publish time recorded by the broker.
    pub published: DateTime<Utc>,
    pub(crate) receipt: Receipt,
}

impl Message {
    /// Build a message from the delivery metadata encoded in its reply subject.
    pub(crate) fn from_delivery(
        subject: impl Into<String>,
        payload: Bytes,
        reply: impl Into<String>,
        ack_deadline: Instant,
    ) -> Result<Self, QueueError> {
        let reply = reply.into();
        let info = AckReply::parse(&reply)?;

        Ok(Self {
            sequence: info.stream_sequence,
            subject: subject.into(),
            payload,
            delivery_count: info.delivered,
            ack_deadline,
            published: info.published(),
            receipt: Receipt::Reply(reply),
        })
    }

    /// Build a message from a JetStream delivery, reading its metadata
    /// through `info()`.
    pub(crate) fn from_jetstream(
        message: async_nats::jetstream::Message,
        ack_deadline: Instant,
    ) -> Result<Self, QueueError> {
        let (sequence, delivery_count, published) = {
            let info = message.info().map_err(QueueError::broker)?;
            let published =
                DateTime::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond())
                    .unwrap_or_default();
            (info.stream_sequence, u64::try_from(info.delivered).unwrap_or(1), published)
        };

        Ok(Self {
            sequence,
            subject: message.subject.to_string(),
            payload: message.payload.clone(),
            delivery_count,
            ack_deadline,
            published,
            receipt: Receipt::JetStream(message),
        })
    }

    /// Whether this is a redelivery.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Whether the ack deadline has already passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.ack_deadline
    }

    /// Deserialize the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// The reply subject used for ack/nak, if the delivery carried one.
    pub fn reply(&self) -> Option<&str> {
        match &self.receipt {
            Receipt::Reply(reply) => Some(reply.as_str()),
            Receipt::JetStream(message) => message.reply.as_deref(),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sequence", &self.sequence)
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Delivery metadata carried by a JetStream ack subject.
///
/// Two layouts exist:
///
/// ```text
/// $JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<timestamp>.<pending>
/// $JS.ACK.<domain>.<account>.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<timestamp>.<pending>.<token>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReply {
    pub stream: String,
    pub consumer: String,
    pub delivered: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub timestamp_nanos: i64,
    pub pending: u64,
}

impl AckReply {
    /// Parse an ack reply subject.
    pub fn parse(reply: &str) -> Result<Self, QueueError> {
        let rest = reply
            .strip_prefix(ACK_PREFIX)
            .and_then(|r| r.strip_prefix('.'))
            .ok_or_else(|| QueueError::broker(format!("not an ack subject: {reply}")))?;

        let tokens: Vec<&str> = rest.split('.').collect();
        let fields = match tokens.len() {
            7 => &tokens[..],
            // Domain and account hash lead, a random token trails
            10 => &tokens[2..9],
            n => {
                return Err(QueueError::broker(format!(
                    "ack subject has {n} tokens after prefix: {reply}"
                )))
            }
        };

        let number = |idx: usize| -> Result<u64, QueueError> {
            fields[idx]
                .parse::<u64>()
                .map_err(|e| QueueError::broker(format!("bad ack subject token '{}': {e}", fields[idx])))
        };

        Ok(Self {
            stream: fields[0].to_string(),
            consumer: fields[1].to_string(),
            delivered: number(2)?,
            stream_sequence: number(3)?,
            consumer_sequence: number(4)?,
            timestamp_nanos: fields[5]
                .parse::<i64>()
                .map_err(|e| QueueError::broker(format!("bad ack timestamp: {e}")))?,
            pending: number(6)?,
        })
    }

    /// Render the short (9-token) layout.
    pub fn to_subject(&self) -> String {
        format!(
            "{ACK_PREFIX}.{}.{}.{}.{}.{}.{}.{}",
            self.stream,
            self.consumer,
            self.delivered,
            self.stream_sequence,
            self.consumer_sequence,
            self.timestamp_nanos,
            self.pending
        )
    }

    /// Publish timestamp as UTC.
    pub fn published(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_short_ack_subject() {
        let reply = AckReply::parse("$JS.ACK.jobs.JobsConsumer.2.17.40.1700000000000000000.3").unwrap();
        assert_eq!(reply.stream, "jobs");
        assert_eq!(reply.consumer, "JobsConsumer");
        assert_eq!(reply.delivered, 2);
        assert_eq!(reply.stream_sequence, 17);
        assert_eq!(reply.consumer_sequence, 40);
        assert_eq!(reply.pending, 3);
        assert_eq!(reply.published().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_domain_ack_subject() {
        let reply =
            AckReply::parse("$JS.ACK.hub.ACCHASH.jobs.JobsConsumer.1.5.5.1700000000000000000.0.xyz")
                .unwrap();
        assert_eq!(reply.stream, "jobs");
        assert_eq!(reply.consumer, "JobsConsumer");
        assert_eq!(reply.delivered, 1);
        assert_eq!(reply.stream_sequence, 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AckReply::parse("_INBOX.abc").is_err());
        assert!(AckReply::parse("$JS.ACK.jobs.c.x.1.1.1.0").is_err());
        assert!(AckReply::parse("$JS.ACK.jobs.c.1.1").is_err());
    }

    #[test]
    fn test_subject_round_trip() {
        let reply = AckReply {
            stream: "jobs".to_string(),
            consumer: "c1".to_string(),
            delivered: 3,
            stream_sequence: 9,
            consumer_sequence: 12,
            timestamp_nanos: 42,
            pending: 0,
        };
        assert_eq!(AckReply::parse(&reply.to_subject()).unwrap(), reply);
    }

    #[tokio::test]
    async fn test_message_from_delivery() {
        let deadline = Instant::now() + Duration::from_secs(30);
        let msg = Message::from_delivery(
            "jobs.info",
            Bytes::from_static(b"{\"n\":1}"),
            "$JS.ACK.jobs.c1.2.8.8.0.0",
            deadline,
        )
        .unwrap();

        assert_eq!(msg.sequence, 8);
        assert_eq!(msg.delivery_count, 2);
        assert_eq!(msg.reply(), Some("$JS.ACK.jobs.c1.2.8.8.0.0"));
        assert!(msg.is_redelivery());
        assert!(!msg.is_expired());

        #[derive(serde::Deserialize)]
        struct Payload {
            n: u32,
        }
        assert_eq!(msg.json::<Payload>().unwrap().n, 1);
    }
}
