//! Job Worker Service (NATS JetStream)
//!
//! A background worker that consumes jobs from a JetStream work queue.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (jobs stream, work-queue retention)
//!   ↓ (Pull Consumer: JobsConsumer)
//! PullIterator → WorkerPool (bounded parallelism)
//!   ↓
//! JobLogger handler → ack / nak / term
//! ```
//!
//! On SIGINT or SIGTERM the worker drains: messages already pulled are
//! handled, then it waits up to the grace period for running handlers.

use core_config::{tracing::install_color_eyre, Environment, FromEnv, NatsConfig};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use workqueue::{
    async_trait, init_metrics, HealthServer, Handler, JetStreamBroker, Message, ProcessingError,
    QueueWorker, ShutdownOutcome, WorkerConfig,
};

/// Logs each job payload.
pub struct JobLogger;

#[async_trait]
impl Handler for JobLogger {
    async fn handle(&self, message: &Message) -> Result<(), ProcessingError> {
        let payload = std::str::from_utf8(&message.payload)
            .map_err(|e| ProcessingError::permanent_with_source("payload is not UTF-8", e))?;
        info!(
            sequence = message.sequence,
            subject = %message.subject,
            delivery = message.delivery_count,
            payload,
            "Processing job"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "job-logger"
    }

    async fn on_exhausted(&self, message: &Message, error: &ProcessingError) {
        error!(
            sequence = message.sequence,
            error = %error,
            "Job gave up after the last allowed delivery"
        );
    }
}

/// Run the job worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, NATS is unreachable, or the
/// consumer cannot be created (for example when its filter overlaps another
/// consumer on the work-queue stream).
pub async fn run() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle = init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        environment = ?environment,
        "Starting job worker service"
    );

    let nats_config = NatsConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    info!(url = %nats_config.url, "Connecting to NATS...");
    let broker = JetStreamBroker::connect(&nats_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", nats_config.url))?;
    info!("Connected to NATS successfully");

    let health_port = worker_config.health_port;
    let worker = QueueWorker::new(Arc::new(broker), worker_config)
        .await
        .wrap_err("Failed to create queue worker")?;

    info!(
        stream = %worker.config().stream.name,
        consumer = %worker.consumer().name(),
        parallelism = worker.config().parallelism,
        "Worker configuration loaded"
    );

    let health_server = HealthServer::new(health_port, worker.health()).with_metrics(metrics_handle);
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "Health server failed");
        }
    });

    let handle = worker.run(JobLogger);

    tokio::select! {
        outcome = handle.wait() => {
            warn!(%outcome, "Worker stopped without a shutdown signal");
        }
        _ = shutdown_signal() => {
            handle.drain();
            let outcome = handle.wait().await;
            if outcome == ShutdownOutcome::ShutdownTimeout {
                warn!(in_flight = handle.in_flight(), "Aborting handlers still running");
                handle.abort();
            }
        }
    }

    info!("Job worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining...");
        },
        _ = terminate => {
            info!("Received SIGTERM, draining...");
        },
    }
}
