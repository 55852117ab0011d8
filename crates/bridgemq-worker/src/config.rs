//! Worker and maintenance configuration.

use std::time::Duration;

use bridgemq_models::{MeshId, ServerId};
use bridgemq_store::DEFAULT_SERVER_TTL_SECS;
use uuid::Uuid;

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity in the server registry and the active-map key.
    pub server_id: ServerId,
    /// Mesh this worker claims from.
    pub mesh_id: MeshId,
    pub stack: String,
    pub region: String,
    pub capabilities: Vec<String>,
    /// Maximum concurrently executing jobs (>= 1).
    pub concurrency: usize,
    /// Claim tick.
    pub tick_interval: Duration,
    /// How long graceful shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
    /// Stall timeout the lock-renewal cadence is derived from
    /// (renewal every `stall_timeout / 3`).
    pub stall_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Registry TTL refreshed by heartbeats; expiry means dead.
    pub server_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::from_string(format!("worker-{}", Uuid::new_v4())),
            mesh_id: MeshId::from_string("default"),
            stack: String::new(),
            region: String::new(),
            capabilities: Vec::new(),
            concurrency: 4,
            tick_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            server_ttl: Duration::from_secs(u64::from(DEFAULT_SERVER_TTL_SECS)),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_id: std::env::var("BRIDGEMQ_SERVER_ID")
                .map(ServerId::from_string)
                .unwrap_or(defaults.server_id),
            mesh_id: std::env::var("BRIDGEMQ_MESH_ID")
                .map(MeshId::from_string)
                .unwrap_or(defaults.mesh_id),
            stack: std::env::var("BRIDGEMQ_STACK").unwrap_or(defaults.stack),
            region: std::env::var("BRIDGEMQ_REGION").unwrap_or(defaults.region),
            capabilities: std::env::var("BRIDGEMQ_CAPABILITIES")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.capabilities),
            concurrency: env_parse("BRIDGEMQ_CONCURRENCY", defaults.concurrency).max(1),
            tick_interval: Duration::from_millis(env_parse(
                "BRIDGEMQ_TICK_INTERVAL_MS",
                defaults.tick_interval.as_millis() as u64,
            )),
            shutdown_timeout: Duration::from_millis(env_parse(
                "BRIDGEMQ_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout.as_millis() as u64,
            )),
            stall_timeout: Duration::from_millis(env_parse(
                "BRIDGEMQ_STALL_TIMEOUT_MS",
                defaults.stall_timeout.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "BRIDGEMQ_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            server_ttl: Duration::from_secs(env_parse(
                "BRIDGEMQ_SERVER_TTL_SECS",
                defaults.server_ttl.as_secs(),
            )),
        }
    }
}

/// Maintenance loop configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub promote_interval: Duration,
    /// Entries promoted per pass (bounded at 100 by the script contract).
    pub promote_batch: u32,
    pub stall_interval: Duration,
    pub stall_timeout: Duration,
    pub max_stall_count: u32,
    pub clean_interval: Duration,
    pub completed_retention: Duration,
    pub cancelled_retention: Duration,
    pub failed_retention: Duration,
    /// Servers whose last heartbeat is older than this are reaped.
    pub server_retention: Duration,
    /// SCAN page size for the clean pass.
    pub scan_page: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            promote_interval: Duration::from_secs(1),
            promote_batch: 100,
            stall_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(300),
            max_stall_count: 3,
            clean_interval: Duration::from_secs(300),
            completed_retention: Duration::from_secs(24 * 3_600),
            cancelled_retention: Duration::from_secs(24 * 3_600),
            failed_retention: Duration::from_secs(7 * 24 * 3_600),
            server_retention: Duration::from_secs(300),
            scan_page: 200,
        }
    }
}

impl MaintenanceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            promote_interval: Duration::from_millis(env_parse(
                "BRIDGEMQ_PROMOTE_INTERVAL_MS",
                defaults.promote_interval.as_millis() as u64,
            )),
            promote_batch: env_parse("BRIDGEMQ_PROMOTE_BATCH", defaults.promote_batch).min(100),
            stall_interval: Duration::from_secs(env_parse(
                "BRIDGEMQ_STALL_INTERVAL_SECS",
                defaults.stall_interval.as_secs(),
            )),
            stall_timeout: Duration::from_millis(env_parse(
                "BRIDGEMQ_STALL_TIMEOUT_MS",
                defaults.stall_timeout.as_millis() as u64,
            )),
            max_stall_count: env_parse("BRIDGEMQ_MAX_STALL_COUNT", defaults.max_stall_count),
            clean_interval: Duration::from_secs(env_parse(
                "BRIDGEMQ_CLEAN_INTERVAL_SECS",
                defaults.clean_interval.as_secs(),
            )),
            completed_retention: Duration::from_secs(env_parse(
                "BRIDGEMQ_COMPLETED_RETENTION_SECS",
                defaults.completed_retention.as_secs(),
            )),
            cancelled_retention: Duration::from_secs(env_parse(
                "BRIDGEMQ_CANCELLED_RETENTION_SECS",
                defaults.cancelled_retention.as_secs(),
            )),
            failed_retention: Duration::from_secs(env_parse(
                "BRIDGEMQ_FAILED_RETENTION_SECS",
                defaults.failed_retention.as_secs(),
            )),
            server_retention: Duration::from_secs(env_parse(
                "BRIDGEMQ_SERVER_RETENTION_SECS",
                defaults.server_retention.as_secs(),
            )),
            scan_page: env_parse("BRIDGEMQ_CLEAN_SCAN_PAGE", defaults.scan_page),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
