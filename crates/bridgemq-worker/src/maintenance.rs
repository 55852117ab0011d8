//! Background maintenance loops.
//!
//! Three independent periodic tasks: delayed promotion, stall detection, and
//! the cleaner. Each is a single-shot invocation per tick, idempotent, and
//! safe to run in any number of processes (the underlying scripts
//! serialize). Every loop logs and continues on error.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use bridgemq_models::JobStatus;
use bridgemq_store::{now_ms, JobRepository, StoreResult};

use crate::config::MaintenanceConfig;

/// Counts from one cleaner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub jobs_deleted: u64,
    pub servers_reaped: u64,
}

/// The maintenance daemon.
pub struct Maintenance {
    repo: Arc<JobRepository>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(repo: Arc<JobRepository>, config: MaintenanceConfig) -> Self {
        Self { repo, config }
    }

    /// Spawn all three loops. Abort the returned set to stop them.
    pub fn spawn(self) -> JoinSet<()> {
        let mut set = JoinSet::new();
        let repo = Arc::clone(&self.repo);
        let config = self.config.clone();

        {
            let repo = Arc::clone(&repo);
            let batch = config.promote_batch;
            let interval = config.promote_interval;
            set.spawn(async move {
                run_loop("promote-delayed", interval, move || {
                    let repo = Arc::clone(&repo);
                    async move {
                        let outcome = repo.promote_delayed(batch, now_ms()).await?;
                        if outcome.processed > 0 {
                            debug!(promoted = outcome.processed, "Promoted delayed jobs");
                        }
                        Ok(())
                    }
                })
                .await;
            });
        }

        {
            let repo = Arc::clone(&repo);
            let stall_timeout = config.stall_timeout;
            let max_stall = config.max_stall_count;
            let interval = config.stall_interval;
            set.spawn(async move {
                run_loop("detect-stalled", interval, move || {
                    let repo = Arc::clone(&repo);
                    async move {
                        let outcome = repo
                            .detect_stalled(stall_timeout.as_millis() as i64, max_stall, now_ms())
                            .await?;
                        if outcome.detected > 0 {
                            info!(
                                detected = outcome.detected,
                                recovered = outcome.recovered,
                                dead_lettered = outcome.moved_to_dlq,
                                "Stall detection pass"
                            );
                        }
                        Ok(())
                    }
                })
                .await;
            });
        }

        {
            let cleaner = Arc::new(Cleaner {
                repo,
                config: config.clone(),
            });
            let interval = config.clean_interval;
            set.spawn(async move {
                run_loop("clean", interval, move || {
                    let cleaner = Arc::clone(&cleaner);
                    async move {
                        let report = cleaner.run_once().await?;
                        if report.jobs_deleted > 0 || report.servers_reaped > 0 {
                            info!(
                                jobs_deleted = report.jobs_deleted,
                                servers_reaped = report.servers_reaped,
                                "Clean pass"
                            );
                        }
                        Ok(())
                    }
                })
                .await;
            });
        }

        set
    }

    /// One cleaner pass, for tests and manual invocation.
    pub async fn clean_once(&self) -> StoreResult<CleanReport> {
        Cleaner {
            repo: Arc::clone(&self.repo),
            config: self.config.clone(),
        }
        .run_once()
        .await
    }
}

async fn run_loop<F, Fut>(name: &'static str, period: Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<()>>,
{
    info!(loop_name = name, period = ?period, "Starting maintenance loop");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = tick().await {
            error!(loop_name = name, "Maintenance tick failed: {}", e);
        }
    }
}

struct Cleaner {
    repo: Arc<JobRepository>,
    config: MaintenanceConfig,
}

impl Cleaner {
    async fn run_once(&self) -> StoreResult<CleanReport> {
        let now = now_ms();
        Ok(CleanReport {
            jobs_deleted: self.reap_terminal_jobs(now).await?,
            servers_reaped: self.reap_dead_servers(now).await?,
        })
    }

    /// SCAN all job metas, deleting terminal jobs past their retention.
    async fn reap_terminal_jobs(&self, now: i64) -> StoreResult<u64> {
        let mut cursor = 0u64;
        let mut deleted = 0u64;
        loop {
            let (next, ids) = self.repo.scan_job_ids(cursor, self.config.scan_page).await?;
            for job_id in ids {
                let Some(meta) = self.repo.get_meta(&job_id).await? else {
                    continue;
                };
                let retention = match meta.status {
                    JobStatus::Completed => self.config.completed_retention,
                    JobStatus::Cancelled => self.config.cancelled_retention,
                    JobStatus::Failed => self.config.failed_retention,
                    _ => continue,
                };
                let finished_at = meta.completed_at.unwrap_or(meta.updated_at);
                if now - finished_at > retention.as_millis() as i64 {
                    self.repo.delete_job(&job_id).await?;
                    deleted += 1;
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }

    /// Reap servers whose heartbeat went stale, plus worker-registry ids
    /// whose registry entry already expired.
    async fn reap_dead_servers(&self, now: i64) -> StoreResult<u64> {
        let mut reaped = 0u64;
        let retention = self.config.server_retention.as_millis() as i64;

        for server_id in self.repo.list_worker_registry().await? {
            match self.repo.get_server(&server_id).await? {
                None => {
                    // Registry entry expired. Keep the worker-registry
                    // membership while the active map is non-empty so the
                    // stall scan can still recover its jobs.
                    if self.active_is_empty(&server_id).await? {
                        self.repo.reap_server(&server_id).await?;
                        reaped += 1;
                    }
                }
                Some(server) if now - server.last_heartbeat > retention => {
                    self.repo.reap_server(&server_id).await?;
                    reaped += 1;
                }
                Some(_) => {}
            }
        }
        Ok(reaped)
    }

    async fn active_is_empty(&self, server_id: &bridgemq_models::ServerId) -> StoreResult<bool> {
        let topology = bridgemq_store::Topology::new(Arc::clone(self.repo.store()));
        Ok(topology.active_count(server_id).await? == 0)
    }
}
