//! Job worker binary: registers with its mesh and runs the claim/execute
//! loop until ctrl-c. Attaches a built-in echo handler to the job types
//! named in `BRIDGEMQ_ECHO_TYPES` (default `echo`) — useful for smoke tests
//! and queue drills. Real deployments embed `bridgemq_worker::Worker` and
//! register their own handlers.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bridgemq_store::{JobRepository, Store, StoreConfig};
use bridgemq_worker::{HandlerOutcome, HandlerRegistry, Worker, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let env_filter = EnvFilter::from_default_env()
        .add_directive("bridgemq=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting bridgemq-worker");

    let store = match Store::connect(StoreConfig::from_env()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to store: {}", e);
            std::process::exit(1);
        }
    };
    let _health = store.spawn_health_probe();

    let repo = Arc::new(JobRepository::new(Arc::clone(&store)));
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let mut registry = HandlerRegistry::new();
    let echo_types = std::env::var("BRIDGEMQ_ECHO_TYPES").unwrap_or_else(|_| "echo".to_string());
    for job_type in echo_types.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        registry.register_fn(job_type, |job, ctx| async move {
            info!(
                job_id = %job.meta.id,
                job_type = %job.meta.job_type,
                bytes = job.payload.len(),
                "Echo handler ran"
            );
            ctx.progress(100.0).await;
            HandlerOutcome::Success(Some(serde_json::json!({
                "bytes": job.payload.len()
            })))
        });
        info!(job_type, "Registered echo handler");
    }

    let worker = Arc::new(Worker::new(config, repo, registry));

    // Ctrl-c flips the shutdown switch; run() drains in-flight jobs and
    // deregisters before returning.
    let shutdown_handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            worker.shutdown();
        })
    };

    if let Err(e) = worker.run().await {
        error!("Worker error: {}", e);
        std::process::exit(1);
    }

    shutdown_handle.abort();
    info!("Worker shutdown complete");
}
