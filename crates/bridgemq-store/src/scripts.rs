//! Atomic server-side scripts and their typed invokers.
//!
//! Every multi-key state transition in the broker runs as one of these Lua
//! scripts, executed with whole-script atomicity. `redis::Script` uploads
//! each script once per connection and addresses it by digest (EVALSHA)
//! afterwards. Scripts never raise; they return status-discriminated arrays
//! that the invokers below decode into typed results.

use bridgemq_models::{BatchId, JobId, JobStatus, MeshId, ServerId};
use redis::aio::ConnectionLike;
use redis::{Script, Value};

use crate::error::{StoreError, StoreResult};
use crate::ratelimit::RateLimitDecision;

/// Why a create call returned an existing job instead of making a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupReason {
    Idempotency,
    Fingerprint,
}

/// Result of a create call.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateReceipt {
    pub job_id: JobId,
    /// Status the job entered with (pending or scheduled). `None` when the
    /// call deduplicated against an existing job.
    pub status: Option<JobStatus>,
    pub deduplicated: Option<DedupReason>,
}

/// Result of finalizing an active job.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteOutcome {
    pub processing_time_ms: i64,
    /// Waiters that became pending because of this completion.
    pub triggered: Vec<JobId>,
}

/// Result of the retry script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOutcome {
    pub will_retry: bool,
    pub moved_to_dlq: bool,
    pub attempt: u32,
    pub delay_ms: i64,
    pub next_run: i64,
}

/// Result of one delayed-promotion pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PromoteOutcome {
    pub processed: u64,
    pub job_ids: Vec<JobId>,
}

/// Result of one stall-detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StallOutcome {
    pub detected: u64,
    pub recovered: u64,
    pub moved_to_dlq: u64,
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The job had already progressed past a cancellable state.
    NotCancellable(JobStatus),
}

/// Result of a batch finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized { size: u64 },
    /// The accumulation list was empty; nothing was created.
    Empty,
}

/// Which list a requeue pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueMode {
    Dlq,
    Overflow,
}

impl RequeueMode {
    fn as_str(self) -> &'static str {
        match self {
            RequeueMode::Dlq => "dlq",
            RequeueMode::Overflow => "overflow",
        }
    }
}

/// Arguments for the create script.
#[derive(Debug, Clone)]
pub(crate) struct CreateJobArgs {
    pub job_id: JobId,
    pub job_type: String,
    pub version: String,
    pub mesh_id: MeshId,
    pub priority: u8,
    pub now: i64,
    pub scheduled_for: i64,
    pub config_json: String,
    pub payload: Vec<u8>,
    /// (key, window seconds)
    pub idempotency: Option<(String, u32)>,
    /// (hash, window seconds)
    pub fingerprint: Option<(String, u32)>,
    pub lifecycle_ttl: u32,
    pub depends: Vec<JobId>,
}

/// Arguments for the claim script.
#[derive(Debug, Clone)]
pub(crate) struct ClaimJobArgs {
    pub mesh_id: MeshId,
    pub server_id: ServerId,
    pub stack: String,
    pub region: String,
    pub capabilities: Vec<String>,
    pub now: i64,
    pub scan_limit: u32,
}

/// The loaded script set. Cheap to clone; digests are computed once.
#[derive(Clone)]
pub struct Scripts {
    create_job: Script,
    claim_job: Script,
    complete_job: Script,
    retry_job: Script,
    process_delayed: Script,
    detect_stalled: Script,
    rate_limit: Script,
    finalize_batch: Script,
    cancel_job: Script,
    requeue_job: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            create_job: Script::new(include_str!("lua/create_job.lua")),
            claim_job: Script::new(include_str!("lua/claim_job.lua")),
            complete_job: Script::new(include_str!("lua/complete_job.lua")),
            retry_job: Script::new(include_str!("lua/retry_job.lua")),
            process_delayed: Script::new(include_str!("lua/process_delayed.lua")),
            detect_stalled: Script::new(include_str!("lua/detect_stalled.lua")),
            rate_limit: Script::new(include_str!("lua/rate_limit.lua")),
            finalize_batch: Script::new(include_str!("lua/finalize_batch.lua")),
            cancel_job: Script::new(include_str!("lua/cancel_job.lua")),
            requeue_job: Script::new(include_str!("lua/requeue_job.lua")),
        }
    }

    pub(crate) async fn create_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        args: &CreateJobArgs,
    ) -> StoreResult<CreateReceipt> {
        let (idem_key, idem_window) = match &args.idempotency {
            Some((k, w)) => (k.as_str(), *w),
            None => ("", 0),
        };
        let (fp, fp_window) = match &args.fingerprint {
            Some((h, w)) => (h.as_str(), *w),
            None => ("", 0),
        };
        let depends_json = serde_json::to_string(&args.depends)?;

        let reply: Vec<Value> = self
            .create_job
            .arg(ns)
            .arg(args.job_id.as_str())
            .arg(&args.job_type)
            .arg(&args.version)
            .arg(args.mesh_id.as_str())
            .arg(args.priority)
            .arg(args.now)
            .arg(args.scheduled_for)
            .arg(&args.config_json)
            .arg(&args.payload[..])
            .arg(idem_key)
            .arg(idem_window)
            .arg(fp)
            .arg(fp_window)
            .arg(args.lifecycle_ttl)
            .arg(&depends_json)
            .invoke_async(conn)
            .await?;

        let created = reply_i64(&reply, 0)? == 1;
        if created {
            let status = JobStatus::parse(&reply_string(&reply, 1)?)
                .ok_or_else(|| StoreError::script_reply("create: bad status"))?;
            Ok(CreateReceipt {
                job_id: JobId::from_string(reply_string(&reply, 2)?),
                status: Some(status),
                deduplicated: None,
            })
        } else {
            let reason = match reply_string(&reply, 1)?.as_str() {
                "idempotency" => DedupReason::Idempotency,
                "fingerprint" => DedupReason::Fingerprint,
                other => {
                    return Err(StoreError::script_reply(format!(
                        "create: unknown dedup reason {other:?}"
                    )))
                }
            };
            Ok(CreateReceipt {
                job_id: JobId::from_string(reply_string(&reply, 2)?),
                status: None,
                deduplicated: Some(reason),
            })
        }
    }

    pub(crate) async fn claim_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        args: &ClaimJobArgs,
    ) -> StoreResult<Option<JobId>> {
        let caps_json = serde_json::to_string(&args.capabilities)?;
        let reply: Vec<Value> = self
            .claim_job
            .arg(ns)
            .arg(args.mesh_id.as_str())
            .arg(args.server_id.as_str())
            .arg(&args.stack)
            .arg(&args.region)
            .arg(&caps_json)
            .arg(args.now)
            .arg(args.scan_limit)
            .invoke_async(conn)
            .await?;

        if reply_i64(&reply, 0)? == 1 {
            Ok(Some(JobId::from_string(reply_string(&reply, 1)?)))
        } else {
            Ok(None)
        }
    }

    pub(crate) async fn complete_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        job_id: &JobId,
        server_id: &ServerId,
        final_status: JobStatus,
        result_json: &str,
        now: i64,
    ) -> StoreResult<CompleteOutcome> {
        let reply: Vec<Value> = self
            .complete_job
            .arg(ns)
            .arg(job_id.as_str())
            .arg(server_id.as_str())
            .arg(final_status.as_str())
            .arg(result_json)
            .arg(now)
            .invoke_async(conn)
            .await?;

        if reply_i64(&reply, 0)? != 1 {
            return Err(ownership_error(&reply, job_id));
        }
        let triggered: Vec<String> = serde_json::from_str(&reply_string(&reply, 2)?)?;
        Ok(CompleteOutcome {
            processing_time_ms: reply_i64(&reply, 1)?,
            triggered: triggered.into_iter().map(JobId::from_string).collect(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn retry_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        job_id: &JobId,
        server_id: &ServerId,
        error_json: &str,
        now: i64,
        jitter_unit: f64,
    ) -> StoreResult<RetryOutcome> {
        let reply: Vec<Value> = self
            .retry_job
            .arg(ns)
            .arg(job_id.as_str())
            .arg(server_id.as_str())
            .arg(error_json)
            .arg(now)
            .arg(jitter_unit)
            .invoke_async(conn)
            .await?;

        if reply_i64(&reply, 0)? != 1 {
            return Err(ownership_error(&reply, job_id));
        }
        Ok(RetryOutcome {
            will_retry: reply_i64(&reply, 1)? == 1,
            moved_to_dlq: reply_i64(&reply, 2)? == 1,
            attempt: reply_i64(&reply, 3)? as u32,
            delay_ms: reply_i64(&reply, 4)?,
            next_run: reply_i64(&reply, 5)?,
        })
    }

    pub(crate) async fn process_delayed<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        now: i64,
        batch_size: u32,
    ) -> StoreResult<PromoteOutcome> {
        let reply: Vec<Value> = self
            .process_delayed
            .arg(ns)
            .arg(now)
            .arg(batch_size)
            .invoke_async(conn)
            .await?;

        let job_ids: Vec<String> = serde_json::from_str(&reply_string(&reply, 1)?)?;
        Ok(PromoteOutcome {
            processed: reply_i64(&reply, 0)? as u64,
            job_ids: job_ids.into_iter().map(JobId::from_string).collect(),
        })
    }

    pub(crate) async fn detect_stalled<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        now: i64,
        stall_timeout_ms: i64,
        max_stall_count: u32,
    ) -> StoreResult<StallOutcome> {
        let reply: Vec<Value> = self
            .detect_stalled
            .arg(ns)
            .arg(now)
            .arg(stall_timeout_ms)
            .arg(max_stall_count)
            .invoke_async(conn)
            .await?;

        Ok(StallOutcome {
            detected: reply_i64(&reply, 0)? as u64,
            recovered: reply_i64(&reply, 1)? as u64,
            moved_to_dlq: reply_i64(&reply, 2)? as u64,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn rate_limit<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        enqueue_job: Option<&JobId>,
        now: i64,
    ) -> StoreResult<RateLimitDecision> {
        let reply: Vec<Value> = self
            .rate_limit
            .arg(ns)
            .arg(bucket)
            .arg(max)
            .arg(window_seconds)
            .arg(enqueue_job.map(JobId::as_str).unwrap_or(""))
            .arg(now)
            .invoke_async(conn)
            .await?;

        Ok(RateLimitDecision {
            allowed: reply_i64(&reply, 0)? == 1,
            remaining: reply_i64(&reply, 1)?.max(0) as u32,
            reset_at: reply_i64(&reply, 2)?,
        })
    }

    pub(crate) async fn finalize_batch<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        mesh_id: &MeshId,
        job_type: &str,
        priority: u8,
        batch_id: &BatchId,
        now: i64,
    ) -> StoreResult<FinalizeOutcome> {
        let reply: Vec<Value> = self
            .finalize_batch
            .arg(ns)
            .arg(mesh_id.as_str())
            .arg(job_type)
            .arg(priority)
            .arg(batch_id.as_str())
            .arg(now)
            .invoke_async(conn)
            .await?;

        if reply_i64(&reply, 0)? == 1 {
            Ok(FinalizeOutcome::Finalized {
                size: reply_i64(&reply, 1)? as u64,
            })
        } else {
            Ok(FinalizeOutcome::Empty)
        }
    }

    pub(crate) async fn cancel_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        job_id: &JobId,
        now: i64,
    ) -> StoreResult<CancelOutcome> {
        let reply: Vec<Value> = self
            .cancel_job
            .arg(ns)
            .arg(job_id.as_str())
            .arg(now)
            .invoke_async(conn)
            .await?;

        if reply_i64(&reply, 0)? == 1 {
            return Ok(CancelOutcome::Cancelled);
        }
        let reason = reply_string(&reply, 1)?;
        if reason == "not_found" {
            return Ok(CancelOutcome::NotFound);
        }
        let status = JobStatus::parse(&reason)
            .ok_or_else(|| StoreError::script_reply(format!("cancel: bad reason {reason:?}")))?;
        Ok(CancelOutcome::NotCancellable(status))
    }

    pub(crate) async fn requeue_job<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        ns: &str,
        job_id: &JobId,
        mode: RequeueMode,
        now: i64,
    ) -> StoreResult<bool> {
        let reply: Vec<Value> = self
            .requeue_job
            .arg(ns)
            .arg(job_id.as_str())
            .arg(mode.as_str())
            .arg(now)
            .invoke_async(conn)
            .await?;
        Ok(reply_i64(&reply, 0)? == 1)
    }
}

fn ownership_error(reply: &[Value], job_id: &JobId) -> StoreError {
    match reply_string(reply, 1).as_deref() {
        Ok("not_found") => StoreError::JobNotFound(job_id.to_string()),
        _ => StoreError::NotOwner {
            job_id: job_id.to_string(),
            owner: None,
        },
    }
}

fn reply_i64(reply: &[Value], idx: usize) -> StoreResult<i64> {
    match reply.get(idx) {
        Some(Value::Int(v)) => Ok(*v),
        Some(Value::BulkString(b)) => std::str::from_utf8(b)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StoreError::script_reply(format!("non-numeric reply at {idx}"))),
        other => Err(StoreError::script_reply(format!(
            "expected integer at {idx}, got {other:?}"
        ))),
    }
}

fn reply_string(reply: &[Value], idx: usize) -> StoreResult<String> {
    match reply.get(idx) {
        Some(Value::BulkString(b)) => Ok(String::from_utf8_lossy(b).into_owned()),
        Some(Value::SimpleString(s)) => Ok(s.clone()),
        Some(Value::Int(v)) => Ok(v.to_string()),
        other => Err(StoreError::script_reply(format!(
            "expected string at {idx}, got {other:?}"
        ))),
    }
}
