//! Test publisher for the job worker
//!
//! Run with: cargo run -p zerg_jobs_worker --bin zerg_jobs_producer

use core_config::{tracing::init_tracing, Environment, FromEnv, NatsConfig};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use workqueue::{Broker, JetStreamBroker, JobProducer, WorkerConfig};

const JOBS: usize = 100;
const SUBJECT: &str = "jobs.info";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(&Environment::from_env());

    let nats_config = NatsConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    let broker = JetStreamBroker::connect(&nats_config)
        .await
        .wrap_err_with(|| format!("Failed to connect to NATS at {}", nats_config.url))?;
    broker
        .ensure_stream(&worker_config.stream)
        .await
        .wrap_err("Failed to ensure jobs stream")?;

    let producer = JobProducer::new(Arc::new(broker));
    for i in 0..JOBS {
        let sequence = producer.publish(SUBJECT, format!("Job payload: {i}")).await?;
        info!(job = i, sequence, "Published job");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    info!(count = JOBS, subject = SUBJECT, "All jobs published");
    Ok(())
}
