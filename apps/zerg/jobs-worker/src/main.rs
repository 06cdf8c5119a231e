//! Job Worker Service (NATS JetStream)
//!
//! Binary entry point for the job worker.

#[tokio::main]
async fn main() {
    if let Err(e) = zerg_jobs_worker::run().await {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
