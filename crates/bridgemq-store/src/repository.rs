//! The state repository: typed read/write helpers over keys + scripts.
//!
//! Every mutation that crosses key boundaries goes through the atomic
//! scripts; the direct commands here are limited to single-key updates
//! (progress, lock renewal, registry hashes) and read-only assembly.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use bridgemq_models::{
    is_valid_job_type, BatchId, Job, JobConfig, JobErrorRecord, JobId, JobMeta, JobStatus,
    JobTemplate, Mesh, MeshId, NewJob, Server, ServerId, ServerStatus,
};

use crate::error::{StoreError, StoreResult};
use crate::keys::Keys;
use crate::meta::{errors_from_list, job_meta_from_map, server_from_map, server_to_pairs};
use crate::pool::Store;
use crate::scripts::{ClaimJobArgs, CreateJobArgs, RequeueMode, Scripts};

pub use crate::scripts::{
    CancelOutcome, CompleteOutcome, CreateReceipt, DedupReason, FinalizeOutcome, PromoteOutcome,
    RetryOutcome, StallOutcome,
};

/// Default TTL for idempotency and fingerprint indexes, seconds.
pub const DEFAULT_DEDUP_WINDOW_SECS: u32 = 3_600;
/// Default server registry TTL, seconds. Absence of the entry means dead.
pub const DEFAULT_SERVER_TTL_SECS: u32 = 90;
/// Claim scan bound across all priorities.
pub const CLAIM_SCAN_LIMIT: u32 = 100;

/// What a worker presents when claiming.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub mesh_id: MeshId,
    pub server_id: ServerId,
    pub stack: String,
    pub region: String,
    pub capabilities: Vec<String>,
}

/// Typed façade over the store.
#[derive(Clone)]
pub struct JobRepository {
    store: Arc<Store>,
    keys: Keys,
    scripts: Scripts,
}

impl JobRepository {
    pub fn new(store: Arc<Store>) -> Self {
        let keys = store.keys();
        Self {
            store,
            keys,
            scripts: Scripts::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a job. Validation failures are fail-fast and nothing is
    /// written; an idempotency or fingerprint hit returns the existing job
    /// id without mutation.
    pub async fn create_job(&self, new: NewJob, now_ms: i64) -> StoreResult<CreateReceipt> {
        if !is_valid_job_type(&new.job_type) {
            return Err(StoreError::validation(format!(
                "invalid job type {:?}",
                new.job_type
            )));
        }
        new.config.validate().map_err(StoreError::Validation)?;

        let scheduled_for = new
            .config
            .schedule
            .as_ref()
            .map(|s| s.resolve(now_ms))
            .unwrap_or(now_ms);

        let idempotency = new
            .config
            .idempotency
            .as_ref()
            .map(|i| (i.key.clone(), i.window));

        let deduplication = new
            .config
            .behavior
            .as_ref()
            .map(|b| b.deduplication)
            .unwrap_or(false);
        let fingerprint = deduplication.then(|| {
            (
                fingerprint_hash(&new.job_type, &new.payload),
                DEFAULT_DEDUP_WINDOW_SECS,
            )
        });

        let depends = new
            .config
            .dependencies
            .as_ref()
            .map(|d| d.wait_for.clone())
            .unwrap_or_default();

        let lifecycle_ttl = new
            .config
            .lifecycle
            .as_ref()
            .and_then(|l| l.ttl)
            .unwrap_or(0);

        let args = CreateJobArgs {
            job_id: JobId::new(),
            job_type: new.job_type,
            version: new.version,
            mesh_id: new.mesh_id,
            priority: new.config.effective_priority(),
            now: now_ms,
            scheduled_for,
            config_json: serde_json::to_string(&new.config)?,
            payload: new.payload,
            idempotency,
            fingerprint,
            lifecycle_ttl,
            depends,
        };

        let mut conn = self.store.conn().await?;
        let receipt = self
            .scripts
            .create_job(&mut conn, self.keys.namespace(), &args)
            .await?;

        match receipt.deduplicated {
            None => debug!(job_id = %receipt.job_id, "Created job"),
            Some(reason) => debug!(
                job_id = %receipt.job_id,
                ?reason,
                "Create deduplicated to existing job"
            ),
        }
        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Header fields only.
    pub async fn get_meta(&self, job_id: &JobId) -> StoreResult<Option<JobMeta>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job_meta(job_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        job_meta_from_map(&map).map(Some)
    }

    /// Assemble the full job: meta, config, payload, result, errors, and
    /// both sides of the dependency graph.
    pub async fn get_job(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let Some(meta) = self.get_meta(job_id).await? else {
            return Ok(None);
        };

        let mut conn = self.store.conn().await?;
        let config_raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.job_config(job_id))
            .query_async(&mut conn)
            .await?;
        let config: JobConfig = match config_raw {
            Some(raw) => serde_json::from_str(&raw)?,
            None => JobConfig::default(),
        };

        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.keys.job_payload(job_id))
            .query_async(&mut conn)
            .await?;

        let result_raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.job_result(job_id))
            .query_async(&mut conn)
            .await?;
        let result = match result_raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        let errors_raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.job_errors(job_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let depends: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.job_depends(job_id))
            .query_async(&mut conn)
            .await?;
        let waiters: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.job_waiters(job_id))
            .query_async(&mut conn)
            .await?;

        Ok(Some(Job {
            meta,
            config,
            payload: payload.unwrap_or_default(),
            result,
            errors: errors_from_list(&errors_raw),
            depends_on: depends.into_iter().map(JobId::from_string).collect(),
            waiters: waiters.into_iter().map(JobId::from_string).collect(),
        }))
    }

    // ------------------------------------------------------------------
    // Claim / finalize
    // ------------------------------------------------------------------

    /// Claim the highest-priority eligible job for this worker, or None.
    pub async fn claim_job(
        &self,
        request: &ClaimRequest,
        now_ms: i64,
    ) -> StoreResult<Option<JobId>> {
        let args = ClaimJobArgs {
            mesh_id: request.mesh_id.clone(),
            server_id: request.server_id.clone(),
            stack: request.stack.clone(),
            region: request.region.clone(),
            capabilities: request.capabilities.clone(),
            now: now_ms,
            scan_limit: CLAIM_SCAN_LIMIT,
        };
        let mut conn = self.store.conn().await?;
        self.scripts
            .claim_job(&mut conn, self.keys.namespace(), &args)
            .await
    }

    /// Finalize an active job. Fails without mutation unless this worker
    /// owns the job.
    pub async fn complete_job(
        &self,
        job_id: &JobId,
        server_id: &ServerId,
        final_status: JobStatus,
        result: Option<&serde_json::Value>,
        now_ms: i64,
    ) -> StoreResult<CompleteOutcome> {
        if !final_status.is_terminal() {
            return Err(StoreError::validation(format!(
                "final status must be terminal, got {}",
                final_status.as_str()
            )));
        }
        let result_json = match result {
            Some(v) => serde_json::to_string(v)?,
            None => String::new(),
        };
        let mut conn = self.store.conn().await?;
        self.scripts
            .complete_job(
                &mut conn,
                self.keys.namespace(),
                job_id,
                server_id,
                final_status,
                &result_json,
                now_ms,
            )
            .await
    }

    /// Record a retryable failure: reschedule with backoff, or move to the
    /// DLQ once attempts are exhausted. The jitter draw happens here so the
    /// script stays deterministic; pass `jitter_unit` in tests.
    pub async fn retry_job(
        &self,
        job_id: &JobId,
        server_id: &ServerId,
        error: &JobErrorRecord,
        now_ms: i64,
        jitter_unit: Option<f64>,
    ) -> StoreResult<RetryOutcome> {
        let unit = jitter_unit.unwrap_or_else(|| rand::thread_rng().gen_range(-1.0..=1.0));
        let error_json = serde_json::to_string(error)?;
        let mut conn = self.store.conn().await?;
        self.scripts
            .retry_job(
                &mut conn,
                self.keys.namespace(),
                job_id,
                server_id,
                &error_json,
                now_ms,
                unit,
            )
            .await
    }

    /// Cancel a job that has not started. The queue entry stays; claim
    /// skips it and the cleaner reaps it.
    pub async fn cancel_job(&self, job_id: &JobId, now_ms: i64) -> StoreResult<CancelOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .cancel_job(&mut conn, self.keys.namespace(), job_id, now_ms)
            .await
    }

    /// Append an error record to the job's bounded history. Single-key;
    /// used for terminal failures that bypass the retry script.
    pub async fn record_error(&self, job_id: &JobId, error: &JobErrorRecord) -> StoreResult<()> {
        let error_json = serde_json::to_string(error)?;
        let mut conn = self.store.conn().await?;
        redis::cmd("RPUSH")
            .arg(self.keys.job_errors(job_id))
            .arg(&error_json)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("LTRIM")
            .arg(self.keys.job_errors(job_id))
            .arg(-(bridgemq_models::job::MAX_ERROR_HISTORY as i64))
            .arg(-1)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Single-key progress write (0–100, clamped).
    pub async fn update_progress(
        &self,
        job_id: &JobId,
        progress: f64,
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.keys.job_meta(job_id))
            .query_async(&mut conn)
            .await?;
        if !exists {
            return Err(StoreError::JobNotFound(job_id.to_string()));
        }
        redis::cmd("HSET")
            .arg(self.keys.job_meta(job_id))
            .arg("progress")
            .arg(progress.clamp(0.0, 100.0))
            .arg("updatedAt")
            .arg(now_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Refresh a worker's claim on a running job so the stall detector
    /// leaves it alone. Ownership is implicit in active-map membership.
    pub async fn renew_lock(
        &self,
        server_id: &ServerId,
        job_id: &JobId,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let mut conn = self.store.conn().await?;
        let held: bool = redis::cmd("HEXISTS")
            .arg(self.keys.active(server_id))
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        if !held {
            return Ok(false);
        }
        redis::cmd("HSET")
            .arg(self.keys.active(server_id))
            .arg(job_id.as_str())
            .arg(now_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Maintenance entry points
    // ------------------------------------------------------------------

    /// Promote due delayed entries into their priority queues.
    pub async fn promote_delayed(
        &self,
        batch_size: u32,
        now_ms: i64,
    ) -> StoreResult<PromoteOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .process_delayed(&mut conn, self.keys.namespace(), now_ms, batch_size)
            .await
    }

    /// Recover stalled jobs across every registered worker.
    pub async fn detect_stalled(
        &self,
        stall_timeout_ms: i64,
        max_stall_count: u32,
        now_ms: i64,
    ) -> StoreResult<StallOutcome> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .detect_stalled(
                &mut conn,
                self.keys.namespace(),
                now_ms,
                stall_timeout_ms,
                max_stall_count,
            )
            .await
    }

    // ------------------------------------------------------------------
    // DLQ surface
    // ------------------------------------------------------------------

    pub async fn dlq_len(&self, mesh: &MeshId) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let len: u64 = redis::cmd("LLEN")
            .arg(self.keys.dlq(mesh))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Most recent DLQ entries first, bounded.
    pub async fn dlq_entries(&self, mesh: &MeshId, limit: usize) -> StoreResult<Vec<JobId>> {
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.dlq(mesh))
            .arg(-(limit as i64))
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(raw.into_iter().rev().map(JobId::from_string).collect())
    }

    /// Put a dead-lettered job back into its priority queue with retry and
    /// stall accounting reset.
    pub async fn requeue_from_dlq(&self, job_id: &JobId, now_ms: i64) -> StoreResult<bool> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .requeue_job(
                &mut conn,
                self.keys.namespace(),
                job_id,
                RequeueMode::Dlq,
                now_ms,
            )
            .await
    }

    pub async fn purge_dlq(&self, mesh: &MeshId) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let len: u64 = redis::cmd("LLEN")
            .arg(self.keys.dlq(mesh))
            .query_async(&mut conn)
            .await?;
        redis::cmd("DEL")
            .arg(self.keys.dlq(mesh))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(len)
    }

    /// Re-enqueue jobs parked by a saturated rate-limit window. Returns how
    /// many were put back.
    pub async fn drain_overflow(
        &self,
        bucket: &str,
        max: usize,
        now_ms: i64,
    ) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let mut drained = 0u64;
        for _ in 0..max {
            let popped: Option<String> = redis::cmd("LPOP")
                .arg(self.keys.ratelimit_queue(bucket))
                .query_async(&mut conn)
                .await?;
            let Some(raw) = popped else { break };
            let job_id = JobId::from_string(raw);
            if self
                .scripts
                .requeue_job(
                    &mut conn,
                    self.keys.namespace(),
                    &job_id,
                    RequeueMode::Overflow,
                    now_ms,
                )
                .await?
            {
                drained += 1;
            }
        }
        Ok(drained)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Add a job to the accumulation list for its (mesh, type).
    pub async fn accumulate_batch(
        &self,
        mesh: &MeshId,
        job_type: &str,
        job_id: &JobId,
    ) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let len: u64 = redis::cmd("RPUSH")
            .arg(self.keys.batch_accumulator(mesh, job_type))
            .arg(job_id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Fold the accumulated jobs into one claimable batch. Returns None
    /// when nothing was accumulated.
    pub async fn finalize_batch(
        &self,
        mesh: &MeshId,
        job_type: &str,
        priority: u8,
        now_ms: i64,
    ) -> StoreResult<Option<(BatchId, u64)>> {
        let batch_id = BatchId::new();
        let mut conn = self.store.conn().await?;
        let outcome = self
            .scripts
            .finalize_batch(
                &mut conn,
                self.keys.namespace(),
                mesh,
                job_type,
                priority,
                &batch_id,
                now_ms,
            )
            .await?;
        match outcome {
            FinalizeOutcome::Finalized { size } => {
                info!(batch_id = %batch_id, size, "Finalized batch");
                Ok(Some((batch_id, size)))
            }
            FinalizeOutcome::Empty => Ok(None),
        }
    }

    /// Member job ids of a finalized batch.
    pub async fn batch_jobs(&self, batch_id: &BatchId) -> StoreResult<Vec<JobId>> {
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.batch_jobs(batch_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(raw.into_iter().map(JobId::from_string).collect())
    }

    // ------------------------------------------------------------------
    // Chains
    // ------------------------------------------------------------------

    /// Take (and clear) the successor templates the complete script
    /// recorded for a finished job.
    pub async fn take_chain_templates(&self, job_id: &JobId) -> StoreResult<Vec<JobTemplate>> {
        let mut conn = self.store.conn().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.job_chain(job_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("DEL")
            .arg(self.keys.job_chain(job_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    /// Materialize the recorded chain successors of a finished job as real
    /// jobs in the given default mesh. Returns the receipts in order.
    pub async fn spawn_chain(
        &self,
        parent: &JobId,
        default_mesh: &MeshId,
        now_ms: i64,
    ) -> StoreResult<Vec<CreateReceipt>> {
        let templates = self.take_chain_templates(parent).await?;
        let mut receipts = Vec::with_capacity(templates.len());
        for template in templates {
            let mesh = template
                .mesh_id
                .clone()
                .map(MeshId::from_string)
                .unwrap_or_else(|| default_mesh.clone());
            let mut config = template.config.map(|c| *c).unwrap_or_default();
            if config.priority.is_none() {
                config.priority = template.priority;
            }
            let new = NewJob::new(template.job_type.clone(), mesh)
                .with_payload(serde_json::to_vec(&template.payload)?)
                .with_config(config);
            match self.create_job(new, now_ms).await {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => warn!(
                    parent = %parent,
                    job_type = %template.job_type,
                    "Chain successor creation failed: {}", e
                ),
            }
        }
        Ok(receipts)
    }

    // ------------------------------------------------------------------
    // Server & mesh registry
    // ------------------------------------------------------------------

    /// Register a server, auto-creating each mesh it belongs to. The entry
    /// lives for `ttl_secs` unless refreshed by heartbeats.
    pub async fn register_server(
        &self,
        server: &Server,
        ttl_secs: u32,
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut entry = server.clone();
        entry.last_heartbeat = now_ms;
        let pairs = server_to_pairs(&entry)?;

        let mut conn = self.store.conn().await?;
        let server_key = self.keys.server(&entry.server_id);
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&server_key);
        for (field, value) in &pairs {
            cmd.arg(*field).arg(value);
        }
        cmd.query_async::<()>(&mut conn).await?;
        redis::cmd("EXPIRE")
            .arg(&server_key)
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;

        for mesh_id in &entry.mesh_ids {
            let mesh_key = self.keys.mesh(mesh_id);
            let created: bool = redis::cmd("HSETNX")
                .arg(&mesh_key)
                .arg("id")
                .arg(mesh_id.as_str())
                .query_async(&mut conn)
                .await?;
            if created {
                redis::cmd("HSET")
                    .arg(&mesh_key)
                    .arg("name")
                    .arg(mesh_id.as_str())
                    .arg("description")
                    .arg("")
                    .arg("createdAt")
                    .arg(now_ms)
                    .arg("config")
                    .arg("{}")
                    .query_async::<()>(&mut conn)
                    .await?;
                info!(mesh_id = %mesh_id, "Auto-created mesh");
            }
            redis::cmd("SADD")
                .arg(self.keys.mesh_members(mesh_id))
                .arg(entry.server_id.as_str())
                .query_async::<()>(&mut conn)
                .await?;
        }

        redis::cmd("SADD")
            .arg(self.keys.worker_registry())
            .arg(entry.server_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;

        info!(server_id = %entry.server_id, "Registered server");
        Ok(())
    }

    /// Refresh a server's TTL, heartbeat timestamp, and load.
    pub async fn heartbeat(
        &self,
        server_id: &ServerId,
        current_load: u32,
        ttl_secs: u32,
        now_ms: i64,
    ) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        let server_key = self.keys.server(server_id);
        redis::cmd("HSET")
            .arg(&server_key)
            .arg("lastHeartbeat")
            .arg(now_ms)
            .arg("currentLoad")
            .arg(current_load)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(&server_key)
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Flip a server to draining so operators can see it winding down.
    pub async fn mark_draining(&self, server_id: &ServerId) -> StoreResult<()> {
        let mut conn = self.store.conn().await?;
        redis::cmd("HSET")
            .arg(self.keys.server(server_id))
            .arg("status")
            .arg(ServerStatus::Draining.as_str())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a server from the registry and its meshes' member sets.
    pub async fn deregister_server(&self, server_id: &ServerId) -> StoreResult<()> {
        let Some(server) = self.get_server(server_id).await? else {
            return Ok(());
        };
        let mut conn = self.store.conn().await?;
        for mesh_id in &server.mesh_ids {
            redis::cmd("SREM")
                .arg(self.keys.mesh_members(mesh_id))
                .arg(server_id.as_str())
                .query_async::<()>(&mut conn)
                .await?;
        }
        redis::cmd("DEL")
            .arg(self.keys.server(server_id))
            .query_async::<()>(&mut conn)
            .await?;
        info!(server_id = %server_id, "Deregistered server");
        Ok(())
    }

    pub async fn get_server(&self, server_id: &ServerId) -> StoreResult<Option<Server>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.server(server_id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        server_from_map(&map).map(Some)
    }

    /// Live servers of a mesh. Members whose registry entries have expired
    /// are treated as dead and skipped.
    pub async fn list_servers(&self, mesh: &MeshId) -> StoreResult<Vec<Server>> {
        let mut conn = self.store.conn().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.mesh_members(mesh))
            .query_async(&mut conn)
            .await?;
        drop(conn);

        let mut servers = Vec::with_capacity(members.len());
        for member in members {
            let server_id = ServerId::from_string(member);
            if let Some(server) = self.get_server(&server_id).await? {
                servers.push(server);
            }
        }
        Ok(servers)
    }

    pub async fn get_mesh(&self, mesh: &MeshId) -> StoreResult<Option<Mesh>> {
        let mut conn = self.store.conn().await?;
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.mesh(mesh))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Mesh {
            id: MeshId::from_string(map.get("id").cloned().unwrap_or_else(|| mesh.to_string())),
            name: map.get("name").cloned().unwrap_or_default(),
            description: map.get("description").cloned().unwrap_or_default(),
            created_at: map
                .get("createdAt")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            config: map
                .get("config")
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(serde_json::Value::Null),
        }))
    }

    // ------------------------------------------------------------------
    // Cleaner support
    // ------------------------------------------------------------------

    /// One SCAN page of job meta keys. Returns the next cursor (0 = done)
    /// and the job ids on this page.
    pub async fn scan_job_ids(&self, cursor: u64, count: usize) -> StoreResult<(u64, Vec<JobId>)> {
        let mut conn = self.store.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(self.keys.job_meta_scan_pattern())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        let ids = keys
            .iter()
            .filter_map(|k| self.keys.job_id_from_meta_key(k))
            .collect();
        Ok((next, ids))
    }

    /// One SCAN page of server registry keys.
    pub async fn scan_server_ids(
        &self,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<ServerId>)> {
        let mut conn = self.store.conn().await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(self.keys.server_scan_pattern())
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        let ids = keys
            .iter()
            .filter_map(|k| self.keys.server_id_from_key(k))
            .collect();
        Ok((next, ids))
    }

    /// Delete every key of a terminal job, pruning its DLQ entry too.
    /// The job must be unowned; callers check terminality first.
    pub async fn delete_job(&self, job_id: &JobId) -> StoreResult<()> {
        let mesh = self.get_meta(job_id).await?.map(|m| m.mesh_id);
        let mut conn = self.store.conn().await?;
        if let Some(mesh) = mesh {
            redis::cmd("LREM")
                .arg(self.keys.dlq(&mesh))
                .arg(0)
                .arg(job_id.as_str())
                .query_async::<()>(&mut conn)
                .await?;
        }
        redis::cmd("DEL")
            .arg(self.keys.job_meta(job_id))
            .arg(self.keys.job_config(job_id))
            .arg(self.keys.job_payload(job_id))
            .arg(self.keys.job_result(job_id))
            .arg(self.keys.job_errors(job_id))
            .arg(self.keys.job_depends(job_id))
            .arg(self.keys.job_waiters(job_id))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Every server id the stall scan will visit.
    pub async fn list_worker_registry(&self) -> StoreResult<Vec<ServerId>> {
        let mut conn = self.store.conn().await?;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.worker_registry())
            .query_async(&mut conn)
            .await?;
        Ok(members.into_iter().map(ServerId::from_string).collect())
    }

    /// Drop a dead server from the registry sets (its hash already expired
    /// or is about to be deleted).
    pub async fn reap_server(&self, server_id: &ServerId) -> StoreResult<()> {
        self.deregister_server(server_id).await?;
        let mut conn = self.store.conn().await?;
        redis::cmd("SREM")
            .arg(self.keys.worker_registry())
            .arg(server_id.as_str())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Content hash for (type, payload) deduplication.
pub fn fingerprint_hash(job_type: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_separates_type_and_payload() {
        // The separator keeps ("ab", "c") distinct from ("a", "bc").
        assert_ne!(fingerprint_hash("ab", b"c"), fingerprint_hash("a", b"bc"));
        assert_eq!(
            fingerprint_hash("encode", b"{\"n\":1}"),
            fingerprint_hash("encode", b"{\"n\":1}")
        );
    }
}
