//! Server registration and the heartbeat task.
//!
//! Registration writes the server entry with a TTL and auto-creates its
//! mesh; the heartbeat task refreshes the TTL and current load until
//! shutdown. An expired entry is how the rest of the system learns a worker
//! died.

use std::sync::Arc;

use bridgemq_store::{now_ms, JobRepository};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use bridgemq_models::Server;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;

/// Build the registry entry a worker presents.
pub fn server_entry(config: &WorkerConfig) -> Server {
    let mut server = Server::new(config.server_id.clone(), config.mesh_id.clone());
    server.stack = config.stack.clone();
    server.region = config.region.clone();
    server.capabilities = config.capabilities.clone();
    server
}

/// Register the worker's server entry.
pub async fn register(repo: &JobRepository, config: &WorkerConfig) -> WorkerResult<()> {
    let ttl = config.server_ttl.as_secs() as u32;
    repo.register_server(&server_entry(config), ttl, now_ms())
        .await?;
    Ok(())
}

/// Spawn the heartbeat loop. `load` reports in-flight jobs each beat; the
/// loop exits when the shutdown channel flips.
pub fn spawn_heartbeat(
    repo: Arc<JobRepository>,
    config: WorkerConfig,
    load: Arc<dyn Fn() -> u32 + Send + Sync>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = config.server_ttl.as_secs() as u32;
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let current_load = load();
                    match repo
                        .heartbeat(&config.server_id, current_load, ttl, now_ms())
                        .await
                    {
                        Ok(()) => {
                            debug!(server_id = %config.server_id, current_load, "Heartbeat");
                        }
                        Err(e) => {
                            warn!(server_id = %config.server_id, "Heartbeat failed: {}", e);
                        }
                    }
                }
            }
        }
    })
}
