//! Prometheus metrics for queue consumption.
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! every call is a no-op, which is what tests rely on.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Metrics labelled by stream and consumer.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    stream: String,
    consumer: String,
}

impl QueueMetrics {
    /// Create new metrics.
    pub fn new(stream: &str, consumer: &str) -> Self {
        Self {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        }
    }

    /// A message was handed to a handler.
    pub fn message_received(&self, redelivery: bool) {
        counter!(
            "workqueue_messages_received_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone(),
            "redelivery" => redelivery.to_string()
        )
        .increment(1);
    }

    /// Handler finished; `outcome` is "ok", "transient" or "permanent".
    pub fn handler_finished(&self, outcome: &'static str, duration: Duration) {
        histogram!(
            "workqueue_handler_duration_seconds",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    pub fn acked(&self) {
        counter!(
            "workqueue_messages_acked_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    pub fn nacked(&self) {
        counter!(
            "workqueue_messages_nacked_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    pub fn terminated(&self) {
        counter!(
            "workqueue_messages_terminated_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// An ack, nak or term round-trip failed.
    pub fn ack_failed(&self, kind: &'static str) {
        counter!(
            "workqueue_ack_failures_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    pub fn heartbeat_missed(&self) {
        counter!(
            "workqueue_missed_heartbeats_total",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .increment(1);
    }

    /// Current number of running handlers.
    pub fn in_flight(&self, count: usize) {
        gauge!(
            "workqueue_in_flight_handlers",
            "stream" => self.stream.clone(),
            "consumer" => self.consumer.clone()
        )
        .set(count as f64);
    }
}

/// Install the Prometheus recorder and return the handle rendering `/metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}
