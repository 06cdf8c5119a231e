//! In-process broker with JetStream work-queue semantics.

use super::{Broker, ConsumerHandle, PullEvent, PullRequest, PullResponse};
use crate::config::{ConsumerDescriptor, Retention, StreamDescriptor};
use crate::error::QueueError;
use crate::message::{AckReply, Message};
use crate::subject::{filter_sets_overlap, subject_matches, subjects_overlap};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Broker kept entirely in memory.
///
/// Honours the contract the core relies on: wildcard subjects, filter
/// uniqueness on work-queue streams, per-delivery ack deadlines, immediate
/// redelivery on nak, `max_deliver`, and idle heartbeats. Cloning shares
/// the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
    heartbeats_suppressed: AtomicBool,
    failing_acks: AtomicUsize,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
}

struct StreamState {
    descriptor: StreamDescriptor,
    messages: BTreeMap<u64, Stored>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
}

struct Stored {
    subject: String,
    payload: Bytes,
    published_nanos: i64,
}

struct ConsumerState {
    descriptor: ConsumerDescriptor,
    cursor: u64,
    consumer_sequence: u64,
    deliveries: HashMap<u64, u64>,
    pending: HashMap<u64, Pending>,
    redeliver: VecDeque<u64>,
    done: HashSet<u64>,
}

#[derive(Clone, Copy)]
struct Pending {
    delivered: u64,
    deadline: Instant,
}

enum Settle {
    Ack,
    Nak,
    Term,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                heartbeats_suppressed: AtomicBool::new(false),
                failing_acks: AtomicUsize::new(0),
            }),
        }
    }

    /// Stop emitting idle heartbeats, simulating a silently broken session.
    pub fn suppress_heartbeats(&self, suppressed: bool) {
        self.inner
            .heartbeats_suppressed
            .store(suppressed, Ordering::SeqCst);
    }

    /// Fail the next `count` ack/nak/term round-trips with a transient error.
    pub fn fail_next_acks(&self, count: usize) {
        self.inner.failing_acks.store(count, Ordering::SeqCst);
    }

    /// Messages still stored in a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Deliveries awaiting acknowledgment for a consumer.
    pub fn pending_count(&self, stream: &str, consumer: &str) -> usize {
        self.inner
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// How many times a sequence was delivered to a consumer.
    pub fn delivery_count(&self, stream: &str, consumer: &str, sequence: u64) -> u64 {
        self.inner
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .and_then(|c| c.deliveries.get(&sequence).copied())
            .unwrap_or(0)
    }

    /// The durable consumer descriptor as stored by the broker.
    pub fn consumer_descriptor(&self, stream: &str, consumer: &str) -> Option<ConsumerDescriptor> {
        self.inner
            .lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map(|c| c.descriptor.clone())
    }

    fn settle(&self, message: &Message, settle: Settle) -> Result<(), QueueError> {
        if self
            .inner
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(QueueError::broker("injected ack failure"));
        }

        let reply = message
            .reply()
            .ok_or_else(|| QueueError::broker("delivery without ack subject"))?;
        let reply = AckReply::parse(reply)?;
        let now = Instant::now();
        let mut state = self.inner.lock();
        let stream = state
            .streams
            .get_mut(&reply.stream)
            .ok_or_else(|| QueueError::StreamNotFound(reply.stream.clone()))?;
        let retention = stream.descriptor.retention;
        let consumer = stream
            .consumers
            .get_mut(&reply.consumer)
            .ok_or_else(|| QueueError::ConsumerNotFound(reply.consumer.clone()))?;

        consumer.expire(now);
        let sequence = reply.stream_sequence;

        let removed = retention == Retention::WorkQueue && !stream.messages.contains_key(&sequence);
        match consumer.pending.get(&sequence) {
            Some(p) if p.delivered == reply.delivered => {}
            // Redundant settle of a finished sequence is a no-op
            _ if removed || consumer.done.contains(&sequence) => return Ok(()),
            _ => return Err(QueueError::AckDeadlineExceeded { sequence }),
        }
        consumer.pending.remove(&sequence);

        match settle {
            Settle::Ack | Settle::Term => {
                if retention == Retention::WorkQueue {
                    // Gone from the stream, nothing left to track
                    stream.messages.remove(&sequence);
                    consumer.deliveries.remove(&sequence);
                } else {
                    consumer.done.insert(sequence);
                }
            }
            Settle::Nak => {
                if consumer.may_redeliver(sequence) {
                    consumer.redeliver.push_front(sequence);
                    drop(state);
                    self.inner.notify();
                } else {
                    debug!(sequence, "Delivery attempts exhausted, not redelivering");
                }
            }
        }
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Hand out the next deliverable message, if any.
    fn claim(&self, stream_name: &str, consumer_name: &str, now: Instant) -> Result<Option<Message>, QueueError> {
        let mut state = self.lock();
        let stream = state
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| QueueError::StreamNotFound(stream_name.to_string()))?;
        let consumer = stream
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer_name.to_string()))?;

        consumer.expire(now);

        let mut next = None;
        while let Some(sequence) = consumer.redeliver.pop_front() {
            if stream.messages.contains_key(&sequence) && !consumer.done.contains(&sequence) {
                next = Some(sequence);
                break;
            }
        }

        if next.is_none() {
            let filters = &consumer.descriptor.filter_subjects;
            let found = stream
                .messages
                .range(consumer.cursor + 1..)
                .find(|(_, m)| {
                    filters.is_empty() || filters.iter().any(|f| subject_matches(f, &m.subject))
                })
                .map(|(seq, _)| *seq);
            if let Some(sequence) = found {
                consumer.cursor = sequence;
                next = Some(sequence);
            } else {
                consumer.cursor = consumer.cursor.max(stream.last_sequence);
            }
        }

        let Some(sequence) = next else {
            return Ok(None);
        };
        let Some(stored) = stream.messages.get(&sequence) else {
            return Ok(None);
        };

        let delivered = consumer.deliveries.entry(sequence).or_insert(0);
        *delivered += 1;
        let delivered = *delivered;
        consumer.consumer_sequence += 1;

        let deadline = now + consumer.descriptor.ack_wait;
        consumer.pending.insert(sequence, Pending { delivered, deadline });

        let reply = AckReply {
            stream: stream_name.to_string(),
            consumer: consumer_name.to_string(),
            delivered,
            stream_sequence: sequence,
            consumer_sequence: consumer.consumer_sequence,
            timestamp_nanos: stored.published_nanos,
            pending: consumer.redeliver.len() as u64,
        };

        Message::from_delivery(
            stored.subject.clone(),
            stored.payload.clone(),
            reply.to_subject(),
            deadline,
        )
        .map(Some)
    }

    /// Earliest ack deadline among outstanding deliveries.
    fn next_expiry(&self, stream_name: &str, consumer_name: &str) -> Option<Instant> {
        self.lock()
            .streams
            .get(stream_name)
            .and_then(|s| s.consumers.get(consumer_name))
            .and_then(|c| c.pending.values().map(|p| p.deadline).min())
    }
}

impl ConsumerState {
    fn new(descriptor: ConsumerDescriptor) -> Self {
        Self {
            descriptor,
            cursor: 0,
            consumer_sequence: 0,
            deliveries: HashMap::new(),
            pending: HashMap::new(),
            redeliver: VecDeque::new(),
            done: HashSet::new(),
        }
    }

    fn may_redeliver(&self, sequence: u64) -> bool {
        let delivered = self.deliveries.get(&sequence).copied().unwrap_or(0);
        self.descriptor.max_deliver.map_or(true, |max| delivered < max)
    }

    /// Move deliveries past their ack deadline back to the redelivery queue.
    fn expire(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();

        for sequence in expired {
            self.pending.remove(&sequence);
            if self.may_redeliver(sequence) {
                self.redeliver.push_back(sequence);
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_stream(&self, stream: &StreamDescriptor) -> Result<(), QueueError> {
        if stream.name.is_empty() {
            return Err(QueueError::config("stream name must not be empty"));
        }
        let mut state = self.inner.lock();
        if state.streams.contains_key(&stream.name) {
            debug!(stream = %stream.name, "Stream already exists");
            return Ok(());
        }

        let clash = state.streams.values().find(|other| {
            other
                .descriptor
                .subjects
                .iter()
                .any(|s| stream.subjects.iter().any(|n| subjects_overlap(s, n)))
        });
        if let Some(other) = clash {
            return Err(QueueError::config(format!(
                "subjects of stream '{}' overlap stream '{}'",
                stream.name, other.descriptor.name
            )));
        }

        info!(stream = %stream.name, subjects = ?stream.subjects, "Creating stream");
        state.streams.insert(
            stream.name.clone(),
            StreamState {
                descriptor: stream.clone(),
                messages: BTreeMap::new(),
                last_sequence: 0,
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        descriptor: &ConsumerDescriptor,
    ) -> Result<ConsumerHandle, QueueError> {
        descriptor.validate()?;

        let mut state = self.inner.lock();
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| QueueError::StreamNotFound(stream.to_string()))?;

        for filter in &descriptor.filter_subjects {
            let covered = stream_state
                .descriptor
                .subjects
                .iter()
                .any(|s| subjects_overlap(s, filter));
            if !covered {
                return Err(QueueError::config(format!(
                    "filter subject '{filter}' is not part of stream '{stream}'"
                )));
            }
        }

        if stream_state.descriptor.retention == Retention::WorkQueue {
            let conflict = stream_state.consumers.values().find(|other| {
                other.descriptor.name != descriptor.name
                    && filter_sets_overlap(&other.descriptor.filter_subjects, &descriptor.filter_subjects)
            });
            if let Some(other) = conflict {
                let details = if other.descriptor.is_unfiltered() && descriptor.is_unfiltered() {
                    "multiple non-filtered consumers not allowed on workqueue stream".to_string()
                } else {
                    format!(
                        "filtered consumer not unique on workqueue stream (conflicts with '{}')",
                        other.descriptor.name
                    )
                };
                return Err(QueueError::FilterOverlap {
                    stream: stream.to_string(),
                    consumer: descriptor.name.clone(),
                    details,
                });
            }
        }

        match stream_state.consumers.get_mut(&descriptor.name) {
            Some(existing) => {
                debug!(consumer = %descriptor.name, "Updating consumer");
                existing.descriptor = descriptor.clone();
            }
            None => {
                info!(consumer = %descriptor.name, stream = %stream, "Creating consumer");
                stream_state
                    .consumers
                    .insert(descriptor.name.clone(), ConsumerState::new(descriptor.clone()));
            }
        }

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
        {
            let state = self.inner.lock();
            let stream = state
                .streams
                .get(&consumer.stream)
                .ok_or_else(|| QueueError::StreamNotFound(consumer.stream.clone()))?;
            if !stream.consumers.contains_key(consumer.name()) {
                return Err(QueueError::ConsumerNotFound(consumer.name().to_string()));
            }
        }

        let now = Instant::now();
        Ok(Box::new(MemoryPull {
            inner: self.inner.clone(),
            stream: consumer.stream.clone(),
            consumer: consumer.name().to_string(),
            batch: request.batch,
            heartbeat: request.idle_heartbeat,
            delivered: 0,
            expires_at: now + request.expires,
            next_heartbeat: request.idle_heartbeat.map(|hb| now + hb),
            changes: self.inner.changes.subscribe(),
            finished: false,
        }))
    }

    async fn ack(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, Settle::Ack)
    }

    async fn nak(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, Settle::Nak)
    }

    async fn term(&self, message: &Message) -> Result<(), QueueError> {
        self.settle(message, Settle::Term)
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<u64, QueueError> {
        let sequence = {
            let mut state = self.inner.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| s.descriptor.subjects.iter().any(|f| subject_matches(f, subject)))
                .ok_or_else(|| QueueError::broker(format!("no stream captures subject '{subject}'")))?;

            stream.last_sequence += 1;
            let sequence = stream.last_sequence;
            stream.messages.insert(
                sequence,
                Stored {
                    subject: subject.to_string(),
                    payload,
                    published_nanos: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                },
            );
            sequence
        };

        self.inner.notify();
        Ok(sequence)
    }
}

struct MemoryPull {
    inner: Arc<Inner>,
    stream: String,
    consumer: String,
    batch: usize,
    heartbeat: Option<std::time::Duration>,
    delivered: usize,
    expires_at: Instant,
    next_heartbeat: Option<Instant>,
    changes: watch::Receiver<u64>,
    finished: bool,
}

#[async_trait]
impl PullResponse for MemoryPull {
    async fn next_event(&mut self) -> Option<Result<PullEvent, QueueError>> {
        loop {
            if self.finished || self.delivered >= self.batch {
                self.finished = true;
                return None;
            }

            // Mark the current version seen before looking, so a publish that
            // lands after the claim still wakes the wait below.
            self.changes.borrow_and_update();
            let now = Instant::now();

            match self.inner.claim(&self.stream, &self.consumer, now) {
                Ok(Some(message)) => {
                    self.delivered += 1;
                    self.next_heartbeat = self.heartbeat.map(|hb| now + hb);
                    return Some(Ok(PullEvent::Message(message)));
                }
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }

            if now >= self.expires_at {
                self.finished = true;
                return None;
            }

            if let (Some(due), Some(interval)) = (self.next_heartbeat, self.heartbeat) {
                if now >= due {
                    self.next_heartbeat = Some(now + interval);
                    if !self.inner.heartbeats_suppressed.load(Ordering::SeqCst) {
                        return Some(Ok(PullEvent::Heartbeat));
                    }
                }
            }

            let mut wake = self.expires_at;
            if let Some(due) = self.next_heartbeat {
                wake = wake.min(due);
            }
            if let Some(expiry) = self.inner.next_expiry(&self.stream, &self.consumer) {
                wake = wake.min(expiry);
            }

            tokio::select! {
                _ = self.changes.changed() => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn drain(&mut self) -> Result<(), QueueError> {
        // Nothing is ever in transit: deliveries are claimed on read.
        self.finished = true;
        Ok(())
    }
}
