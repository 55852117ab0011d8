//! Maintenance daemon: runs the promote, stall-detection, and clean loops
//! against a store. Workers embed the library; this binary is the piece you
//! deploy beside them (any number of instances is safe).

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bridgemq_store::{JobRepository, Store, StoreConfig};
use bridgemq_worker::{Maintenance, MaintenanceConfig};

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

    info!("Starting bridgemq-maintenance");

    let store = match Store::connect(StoreConfig::from_env()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to store: {}", e);
            std::process::exit(1);
        }
    };
    let _health = store.spawn_health_probe();

    let repo = Arc::new(JobRepository::new(Arc::clone(&store)));
    let config = MaintenanceConfig::from_env();
    info!("Maintenance config: {:?}", config);

    let mut loops = Maintenance::new(repo, config).spawn();

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");

    loops.abort_all();
    while loops.join_next().await.is_some() {}

    info!("Maintenance shutdown complete");
}
