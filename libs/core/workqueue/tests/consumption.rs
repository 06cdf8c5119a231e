//! End-to-end consumption tests against the in-process broker

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use workqueue::{
    async_trait, handler_fn, Broker, ConsumerDescriptor, ControllerState, Handler, HeartbeatPolicy,
    MemoryBroker, Message, ProcessingError, QueueError, QueueWorker, SessionState, ShutdownOutcome,
    StreamDescriptor, Topology, WorkerConfig,
};

const STREAM: &str = "jobs";
const CONSUMER: &str = "JobsConsumer";

fn config(parallelism: usize) -> WorkerConfig {
    WorkerConfig::new(
        StreamDescriptor::work_queue(STREAM, &["jobs.>"]),
        ConsumerDescriptor::durable(CONSUMER).with_ack_wait(Duration::from_secs(30)),
    )
    .with_parallelism(parallelism)
    .with_pull_expires(Duration::from_secs(10))
    .with_heartbeat(HeartbeatPolicy::fail_after(Duration::from_secs(2)))
    .with_shutdown_grace(Duration::from_secs(5))
}

async fn publish_jobs(broker: &MemoryBroker, count: usize) {
    for i in 0..count {
        broker
            .publish("jobs.info", Bytes::from(format!("Job payload: {i}")))
            .await
            .expect("Failed to publish job");
    }
}

/// Poll `condition` until it holds, failing the test after `limit`.
async fn eventually(limit: Duration, condition: impl Fn() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Tracks how many handlers run at once.
#[derive(Clone, Default)]
struct Concurrency {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

impl Concurrency {
    async fn observe(&self, busy: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(busy).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }
}

mod concurrency_tests {
    use super::*;

    async fn assert_bounded(topology: Topology) {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(
            Arc::new(broker.clone()),
            config(5).with_topology(topology),
        )
        .await
        .unwrap();
        publish_jobs(&broker, 30).await;

        let tracker = Concurrency::default();
        let observed = tracker.clone();
        let handle = worker.run(handler_fn("sleepy", move |_message: Message| {
            let tracker = observed.clone();
            async move {
                tracker.observe(Duration::from_millis(100)).await;
                Ok(())
            }
        }));

        eventually(Duration::from_secs(30), || tracker.done() == 30).await;
        assert!(handle.in_flight() <= 5);
        assert!(handle.stop());
        assert_eq!(handle.wait().await, ShutdownOutcome::CleanShutdown);

        assert!(tracker.peak() <= 5, "peak concurrency {}", tracker.peak());
        assert!(tracker.peak() > 1, "handlers never overlapped");
        assert_eq!(broker.stream_len(STREAM), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_then_dispatch_is_bounded() {
        assert_bounded(Topology::PullThenDispatch).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_per_worker_is_bounded() {
        assert_bounded(Topology::PullPerWorker).await;
    }
}

mod shutdown_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stop_unblocks_idle_worker() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(3))
            .await
            .unwrap();
        let handle = worker.run(handler_fn("noop", |_message: Message| async { Ok(()) }));

        // Every loop is parked in a fetch on an empty stream
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.state(), ControllerState::Running);

        let started = tokio::time::Instant::now();
        assert!(handle.stop());
        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("stop did not unblock the fetch loops");

        assert_eq!(outcome, ShutdownOutcome::CleanShutdown);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.state(), ControllerState::Terminated);
        assert_eq!(handle.session_state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_processes_in_transit_messages() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(2))
            .await
            .unwrap();
        publish_jobs(&broker, 10).await;

        let tracker = Concurrency::default();
        let observed = tracker.clone();
        let handle = worker.run(handler_fn("slow", move |_message: Message| {
            let tracker = observed.clone();
            async move {
                tracker.observe(Duration::from_millis(200)).await;
                Ok(())
            }
        }));

        eventually(Duration::from_secs(5), || tracker.done() >= 1).await;
        assert!(handle.drain());
        assert_eq!(handle.wait().await, ShutdownOutcome::CleanShutdown);

        // Whatever left the broker was handled and acked; nothing is stranded
        let acked = 10 - broker.stream_len(STREAM);
        assert_eq!(tracker.done(), acked);
        assert_eq!(broker.pending_count(STREAM, CONSUMER), 0);
        let untouched = (1..=10)
            .filter(|seq| broker.delivery_count(STREAM, CONSUMER, *seq) == 0)
            .count();
        assert_eq!(untouched, 10, "remaining messages were never delivered");
        assert!(acked < 10, "drain should cut consumption short");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(2))
            .await
            .unwrap();
        let handle = worker.run(handler_fn("noop", |_message: Message| async { Ok(()) }));
        let other = handle.clone();

        assert!(handle.stop());
        assert!(!other.drain());
        assert!(!handle.stop());
        assert_eq!(handle.state(), ControllerState::ShuttingDown);

        let first = handle.wait().await;
        let second = other.wait().await;
        assert_eq!(first, ShutdownOutcome::CleanShutdown);
        assert_eq!(first, second);

        // Requests after termination change nothing
        assert!(!handle.drain());
        assert_eq!(handle.state(), ControllerState::Terminated);
        assert_eq!(handle.wait().await, ShutdownOutcome::CleanShutdown);
    }

    /// One job whose handler takes `busy`, with a one second grace period.
    async fn slow_worker(
        topology: Topology,
        busy: Duration,
    ) -> (MemoryBroker, workqueue::WorkerHandle, Concurrency) {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(
            Arc::new(broker.clone()),
            config(1)
                .with_topology(topology)
                .with_shutdown_grace(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        publish_jobs(&broker, 1).await;

        let tracker = Concurrency::default();
        let observed = tracker.clone();
        let handle = worker.run(handler_fn("slow", move |_message: Message| {
            let tracker = observed.clone();
            async move {
                tracker.observe(busy).await;
                Ok(())
            }
        }));

        let running = tracker.clone();
        eventually(Duration::from_secs(5), move || running.peak() == 1).await;
        (broker, handle, tracker)
    }

    async fn assert_timeout_leaves_handler_running(topology: Topology) {
        let (broker, handle, tracker) = slow_worker(topology, Duration::from_secs(5)).await;

        handle.stop();
        assert_eq!(handle.wait().await, ShutdownOutcome::ShutdownTimeout);
        assert_eq!(handle.in_flight(), 1);

        // Without abort() the handler runs to completion and acks
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(tracker.done(), 1, "{topology:?} handler was cancelled");
        assert_eq!(handle.in_flight(), 0);
        assert_eq!(broker.stream_len(STREAM), 0);
    }

    async fn assert_abort_cancels_handler(topology: Topology) {
        let (broker, handle, tracker) = slow_worker(topology, Duration::from_secs(3600)).await;

        handle.stop();
        assert_eq!(handle.wait().await, ShutdownOutcome::ShutdownTimeout);

        handle.abort();
        eventually(Duration::from_secs(5), || handle.in_flight() == 0).await;
        assert_eq!(tracker.done(), 0);
        // The abandoned delivery was never acknowledged
        assert_eq!(broker.stream_len(STREAM), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timeout_does_not_cancel_dispatched_handler() {
        assert_timeout_leaves_handler_running(Topology::PullThenDispatch).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_timeout_does_not_cancel_per_worker_handler() {
        assert_timeout_leaves_handler_running(Topology::PullPerWorker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_timeout_dispatched() {
        assert_abort_cancels_handler(Topology::PullThenDispatch).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_after_timeout_per_worker() {
        assert_abort_cancels_handler(Topology::PullPerWorker).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_signal() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(2))
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);

        let run = tokio::spawn(worker.run_until(
            handler_fn("noop", |_message: Message| async { Ok(()) }),
            rx,
            workqueue::ShutdownMode::Drain,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        assert_eq!(run.await.unwrap(), ShutdownOutcome::CleanShutdown);
    }
}

mod filter_tests {
    use super::*;

    fn consumer(name: &str, filters: &[&str]) -> WorkerConfig {
        WorkerConfig::new(
            StreamDescriptor::work_queue(STREAM, &["jobs.>"]),
            ConsumerDescriptor::durable(name).with_filter_subjects(filters.iter().copied()),
        )
    }

    #[tokio::test]
    async fn test_overlapping_filters_are_rejected() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        QueueWorker::new(broker.clone(), consumer("info", &["jobs.info"]))
            .await
            .unwrap();
        QueueWorker::new(broker.clone(), consumer("errors", &["jobs.error"]))
            .await
            .unwrap();

        let err = QueueWorker::new(broker.clone(), consumer("everything", &["jobs.*"]))
            .await
            .err()
            .expect("overlapping filter should be rejected");
        match err {
            QueueError::FilterOverlap { stream, consumer, .. } => {
                assert_eq!(stream, STREAM);
                assert_eq!(consumer, "everything");
            }
            other => panic!("expected FilterOverlap, got {other:?}"),
        }

        // An unfiltered consumer overlaps every filtered one
        let err = QueueWorker::new(broker.clone(), consumer("all", &[]))
            .await
            .err()
            .expect("unfiltered consumer should be rejected");
        assert!(matches!(err, QueueError::FilterOverlap { .. }));
    }

    #[tokio::test]
    async fn test_updating_own_filter_is_allowed() {
        let broker = MemoryBroker::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());

        QueueWorker::new(shared.clone(), consumer("info", &["jobs.info"]))
            .await
            .unwrap();
        QueueWorker::new(shared.clone(), consumer("info", &["jobs.info", "jobs.debug"]))
            .await
            .unwrap();

        let stored = broker.consumer_descriptor(STREAM, "info").unwrap();
        assert_eq!(stored.filter_subjects, vec!["jobs.info", "jobs.debug"]);
    }
}

mod delivery_tests {
    use super::*;

    /// Always fails transiently and records exhaustion.
    struct Flaky {
        deliveries: Arc<Mutex<Vec<u64>>>,
        exhausted: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Handler for Flaky {
        async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
            self.deliveries.lock().unwrap().push(message.delivery_count);
            Err(ProcessingError::transient("downstream unavailable"))
        }

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn on_exhausted(&self, message: &Message, _error: &ProcessingError) {
            self.exhausted.lock().unwrap().push(message.delivery_count);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_stops_at_max_deliver() {
        let broker = MemoryBroker::new();
        let mut config = config(2);
        config.consumer = config.consumer.with_max_deliver(3);
        let worker = QueueWorker::new(Arc::new(broker.clone()), config)
            .await
            .unwrap();
        publish_jobs(&broker, 1).await;

        let deliveries: Arc<Mutex<Vec<u64>>> = Arc::default();
        let exhausted: Arc<Mutex<Vec<u64>>> = Arc::default();
        let handle = worker.run(Flaky {
            deliveries: deliveries.clone(),
            exhausted: exhausted.clone(),
        });

        eventually(Duration::from_secs(5), || deliveries.lock().unwrap().len() == 3).await;
        // Past ack_wait nothing comes back either
        tokio::time::sleep(Duration::from_secs(60)).await;

        handle.stop();
        assert_eq!(handle.wait().await, ShutdownOutcome::CleanShutdown);
        // One more per delivery, and nothing past the bound
        assert_eq!(*deliveries.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*exhausted.lock().unwrap(), vec![3]);
        assert_eq!(broker.delivery_count(STREAM, CONSUMER, 1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_terminates() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(1))
            .await
            .unwrap();
        publish_jobs(&broker, 1).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = worker.run(handler_fn("poison", move |_message: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProcessingError::permanent("malformed payload"))
            }
        }));

        eventually(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.stop();
        handle.wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stream_len(STREAM), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hundred_jobs_each_acked_once() {
        let broker = MemoryBroker::new();
        let worker = QueueWorker::new(Arc::new(broker.clone()), config(5))
            .await
            .unwrap();
        publish_jobs(&broker, 100).await;

        let seen: Arc<Mutex<HashMap<u64, usize>>> = Arc::default();
        let tracker = Concurrency::default();
        let (seen_by_handler, observed) = (seen.clone(), tracker.clone());
        let handle = worker.run(handler_fn("jobs", move |message: Message| {
            let seen = seen_by_handler.clone();
            let tracker = observed.clone();
            async move {
                let payload = String::from_utf8_lossy(&message.payload).into_owned();
                assert!(payload.starts_with("Job payload: "));
                *seen.lock().unwrap().entry(message.sequence).or_default() += 1;
                tracker.observe(Duration::from_millis(20)).await;
                Ok(())
            }
        }));

        eventually(Duration::from_secs(60), || tracker.done() == 100).await;
        handle.drain();
        assert_eq!(handle.wait().await, ShutdownOutcome::CleanShutdown);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 100);
        assert!(seen.values().all(|count| *count == 1));
        assert!(tracker.peak() <= 5);
        assert_eq!(broker.stream_len(STREAM), 0);
        assert_eq!(broker.pending_count(STREAM, CONSUMER), 0);
    }
}
