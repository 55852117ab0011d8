//! The claim/execute/complete loop.
//!
//! One worker owns one server identity. Every tick it claims at most one job
//! while it has concurrency headroom; each claimed job runs as its own task
//! holding a semaphore permit, with a renewal task keeping the claim fresh
//! for as long as the handler runs. Outcomes map onto the store scripts:
//! success and terminal failures finalize, eligible failures go through the
//! retry script.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use bridgemq_models::{ErrorCode, JobErrorRecord, JobId, JobStatus, MeshId, ServerId};
use bridgemq_store::{now_ms, ClaimRequest, JobRepository};

use crate::classify::{classify_failure, FailureDisposition};
use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::handler::{HandlerOutcome, HandlerRegistry, JobContext};
use crate::heartbeat;

/// In-process lifecycle events for embedders.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        server_id: ServerId,
    },
    JobStart {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        progress: f64,
    },
    JobComplete {
        job_id: JobId,
        processing_time_ms: i64,
    },
    JobFail {
        job_id: JobId,
        message: String,
        will_retry: bool,
    },
    Stopped {
        server_id: ServerId,
    },
}

/// A claiming, executing worker process.
pub struct Worker {
    config: WorkerConfig,
    repo: Arc<JobRepository>,
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(config: WorkerConfig, repo: Arc<JobRepository>, registry: HandlerRegistry) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            repo,
            registry: Arc::new(registry),
            semaphore,
            shutdown,
            events,
        }
    }

    /// Subscribe to in-process worker events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Signal graceful shutdown: stop claiming, let in-flight jobs finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Jobs currently executing.
    pub fn inflight(&self) -> usize {
        self.config.concurrency - self.semaphore.available_permits()
    }

    /// Run until shutdown. Registers the server, heartbeats, claims on every
    /// tick with headroom, and on shutdown waits up to the configured
    /// timeout for in-flight jobs (the stall detector recovers any
    /// leftovers).
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            server_id = %self.config.server_id,
            mesh_id = %self.config.mesh_id,
            concurrency = self.config.concurrency,
            "Starting worker"
        );

        heartbeat::register(&self.repo, &self.config).await?;

        let load_semaphore = Arc::clone(&self.semaphore);
        let concurrency = self.config.concurrency;
        let heartbeat_task = heartbeat::spawn_heartbeat(
            Arc::clone(&self.repo),
            self.config.clone(),
            Arc::new(move || (concurrency - load_semaphore.available_permits()) as u32),
            self.shutdown.subscribe(),
        );

        let _ = self.events.send(WorkerEvent::Started {
            server_id: self.config.server_id.clone(),
        });

        let claim_request = ClaimRequest {
            mesh_id: self.config.mesh_id.clone(),
            server_id: self.config.server_id.clone(),
            stack: self.config.stack.clone(),
            region: self.config.region.clone(),
            capabilities: self.config.capabilities.clone(),
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping claim loop");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.semaphore.available_permits() == 0 {
                        continue;
                    }
                    match self.repo.claim_job(&claim_request, now_ms()).await {
                        Ok(Some(job_id)) => {
                            let Ok(permit) =
                                Arc::clone(&self.semaphore).try_acquire_owned()
                            else {
                                continue;
                            };
                            let repo = Arc::clone(&self.repo);
                            let registry = Arc::clone(&self.registry);
                            let config = self.config.clone();
                            let events = self.events.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                execute_job(repo, registry, config, events, job_id).await;
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Claim failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_idle())
            .await
            .is_ok();
        if !drained {
            warn!(
                inflight = self.inflight(),
                "Shutdown timeout reached with jobs still in flight; stall recovery will reclaim them"
            );
        }

        heartbeat_task.abort();
        if let Err(e) = self.repo.deregister_server(&self.config.server_id).await {
            warn!("Deregistration failed: {}", e);
        }

        let _ = self.events.send(WorkerEvent::Stopped {
            server_id: self.config.server_id.clone(),
        });
        info!(server_id = %self.config.server_id, "Worker stopped");
        Ok(())
    }

    async fn wait_for_idle(&self) {
        loop {
            if self.semaphore.available_permits() == self.config.concurrency {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Execute one claimed job end to end.
async fn execute_job(
    repo: Arc<JobRepository>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    events: broadcast::Sender<WorkerEvent>,
    job_id: JobId,
) {
    let job = match repo.get_job(&job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(job_id = %job_id, "Claimed job vanished before execution");
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, "Failed to read claimed job: {}", e);
            return;
        }
    };

    debug!(job_id = %job_id, job_type = %job.meta.job_type, "Executing job");
    let _ = events.send(WorkerEvent::JobStart {
        job_id: job_id.clone(),
    });

    let retry_enabled = job.config.effective_retry().enabled;
    let mesh_id = job.meta.mesh_id.clone();
    let job_type = job.meta.job_type.clone();
    let attempt = job.meta.attempt;

    let outcome = match registry.get(&job_type) {
        Some(handler) => {
            let renewal = spawn_renewal(&repo, &config, &job_id);
            let ctx = JobContext::new(job_id.clone(), Arc::clone(&repo), events.clone());
            let result = AssertUnwindSafe(handler.run(job, ctx)).catch_unwind().await;
            renewal.abort();
            match result {
                Ok(outcome) => outcome,
                Err(panic) => HandlerOutcome::Retry(JobErrorRecord::new(
                    ErrorCode::HandlerPanic,
                    panic_message(&panic),
                )),
            }
        }
        None => HandlerOutcome::Fail(JobErrorRecord::new(
            ErrorCode::WorkerCapabilityMismatch,
            format!("no handler registered for job type {job_type:?}"),
        )),
    };

    match outcome {
        HandlerOutcome::Success(result) => {
            match repo
                .complete_job(
                    &job_id,
                    &config.server_id,
                    JobStatus::Completed,
                    result.as_ref(),
                    now_ms(),
                )
                .await
            {
                Ok(done) => {
                    debug!(
                        job_id = %job_id,
                        processing_time_ms = done.processing_time_ms,
                        triggered = done.triggered.len(),
                        "Job completed"
                    );
                    let _ = events.send(WorkerEvent::JobComplete {
                        job_id: job_id.clone(),
                        processing_time_ms: done.processing_time_ms,
                    });
                    spawn_chain_successors(&repo, &job_id, &mesh_id).await;
                }
                Err(e) => error!(job_id = %job_id, "Completion failed: {}", e),
            }
        }
        HandlerOutcome::Retry(err) => {
            let disposition = classify_failure(retry_enabled, &err);
            finalize_failure(
                &repo,
                &config,
                &events,
                &job_id,
                &mesh_id,
                attempt,
                err,
                disposition,
            )
            .await;
        }
        HandlerOutcome::Fail(err) => {
            finalize_failure(
                &repo,
                &config,
                &events,
                &job_id,
                &mesh_id,
                attempt,
                err,
                FailureDisposition::Terminal,
            )
            .await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize_failure(
    repo: &Arc<JobRepository>,
    config: &WorkerConfig,
    events: &broadcast::Sender<WorkerEvent>,
    job_id: &JobId,
    mesh_id: &MeshId,
    attempt: u32,
    mut err: JobErrorRecord,
    disposition: FailureDisposition,
) {
    err.attempt = attempt + 1;
    err.at = now_ms();

    match disposition {
        FailureDisposition::Retry => {
            match repo
                .retry_job(job_id, &config.server_id, &err, now_ms(), None)
                .await
            {
                Ok(outcome) => {
                    if outcome.moved_to_dlq {
                        warn!(
                            job_id = %job_id,
                            attempt = outcome.attempt,
                            "Retries exhausted, job dead-lettered"
                        );
                    } else {
                        info!(
                            job_id = %job_id,
                            attempt = outcome.attempt,
                            delay_ms = outcome.delay_ms,
                            "Job scheduled for retry"
                        );
                    }
                    let _ = events.send(WorkerEvent::JobFail {
                        job_id: job_id.clone(),
                        message: err.message.clone(),
                        will_retry: outcome.will_retry,
                    });
                }
                Err(e) => error!(job_id = %job_id, "Retry bookkeeping failed: {}", e),
            }
        }
        FailureDisposition::Terminal => {
            if let Err(e) = repo.record_error(job_id, &err).await {
                warn!(job_id = %job_id, "Could not record error: {}", e);
            }
            match repo
                .complete_job(job_id, &config.server_id, JobStatus::Failed, None, now_ms())
                .await
            {
                Ok(_) => {
                    warn!(job_id = %job_id, code = err.code.as_u16(), "Job failed terminally");
                    let _ = events.send(WorkerEvent::JobFail {
                        job_id: job_id.clone(),
                        message: err.message.clone(),
                        will_retry: false,
                    });
                    spawn_chain_successors(repo, job_id, mesh_id).await;
                }
                Err(e) => error!(job_id = %job_id, "Terminal failure bookkeeping failed: {}", e),
            }
        }
    }
}

/// Materialize any chain successors the completion recorded.
async fn spawn_chain_successors(repo: &Arc<JobRepository>, job_id: &JobId, mesh_id: &MeshId) {
    match repo.spawn_chain(job_id, mesh_id, now_ms()).await {
        Ok(receipts) if !receipts.is_empty() => {
            debug!(job_id = %job_id, successors = receipts.len(), "Spawned chain successors");
        }
        Ok(_) => {}
        Err(e) => warn!(job_id = %job_id, "Chain spawn failed: {}", e),
    }
}

/// Keep the active-map entry fresh while the handler runs: rewrite
/// claimedAt every `stall_timeout / 3`.
fn spawn_renewal(
    repo: &Arc<JobRepository>,
    config: &WorkerConfig,
    job_id: &JobId,
) -> JoinHandle<()> {
    let repo = Arc::clone(repo);
    let server_id = config.server_id.clone();
    let job_id = job_id.clone();
    let period = config.stall_timeout / 3;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match repo.renew_lock(&server_id, &job_id, now_ms()).await {
                Ok(true) => debug!(job_id = %job_id, "Renewed claim"),
                Ok(false) => {
                    warn!(job_id = %job_id, "Claim no longer held, stopping renewal");
                    break;
                }
                Err(e) => warn!(job_id = %job_id, "Claim renewal failed: {}", e),
            }
        }
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
