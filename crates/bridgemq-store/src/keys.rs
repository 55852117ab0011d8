//! Key schema.
//!
//! Every entity lives under a single namespace prefix (default `bridgemq`).
//! All key construction goes through this module so the layout has exactly
//! one definition in the codebase; the Lua scripts rebuild the same names
//! from the namespace they receive as an argument.

use bridgemq_models::{BatchId, JobId, MeshId, ServerId};

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "bridgemq";

/// Key builder bound to a namespace prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    ns: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keys {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// `{ns}:job:{id}:meta` — job header field-map.
    pub fn job_meta(&self, id: &JobId) -> String {
        format!("{}:job:{}:meta", self.ns, id)
    }

    /// `{ns}:job:{id}:config` — behavior config JSON blob.
    pub fn job_config(&self, id: &JobId) -> String {
        format!("{}:job:{}:config", self.ns, id)
    }

    /// `{ns}:job:{id}:payload` — opaque payload bytes.
    pub fn job_payload(&self, id: &JobId) -> String {
        format!("{}:job:{}:payload", self.ns, id)
    }

    /// `{ns}:job:{id}:result` — handler return value JSON blob.
    pub fn job_result(&self, id: &JobId) -> String {
        format!("{}:job:{}:result", self.ns, id)
    }

    /// `{ns}:job:{id}:errors` — bounded error-history list.
    pub fn job_errors(&self, id: &JobId) -> String {
        format!("{}:job:{}:errors", self.ns, id)
    }

    /// `{ns}:job:{id}:depends` — unsatisfied dependency set.
    pub fn job_depends(&self, id: &JobId) -> String {
        format!("{}:job:{}:depends", self.ns, id)
    }

    /// `{ns}:job:{id}:waiters` — reverse dependency set.
    pub fn job_waiters(&self, id: &JobId) -> String {
        format!("{}:job:{}:waiters", self.ns, id)
    }

    /// `{ns}:chain:{id}` — successor templates recorded at completion.
    pub fn job_chain(&self, id: &JobId) -> String {
        format!("{}:chain:{}", self.ns, id)
    }

    /// `{ns}:queue:{meshId}:{type}:p{priority}` — priority queue zset.
    pub fn queue(&self, mesh: &MeshId, job_type: &str, priority: u8) -> String {
        format!("{}:queue:{}:{}:p{}", self.ns, mesh, job_type, priority)
    }

    /// `{ns}:queues:{meshId}` — registry of populated `{type}:{priority}`
    /// tuples, consulted by the claim scan instead of wildcard key listing.
    pub fn queue_registry(&self, mesh: &MeshId) -> String {
        format!("{}:queues:{}", self.ns, mesh)
    }

    /// `{ns}:pending:{meshId}` — aggregated pending index (score=priority).
    pub fn pending_index(&self, mesh: &MeshId) -> String {
        format!("{}:pending:{}", self.ns, mesh)
    }

    /// `{ns}:active:{serverId}` — per-worker active map (jobId → claimedAt).
    pub fn active(&self, server: &ServerId) -> String {
        format!("{}:active:{}", self.ns, server)
    }

    /// `{ns}:delayed` — global delayed zset (score=scheduledFor).
    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.ns)
    }

    /// `{ns}:dlq:{meshId}` — dead-letter list.
    pub fn dlq(&self, mesh: &MeshId) -> String {
        format!("{}:dlq:{}", self.ns, mesh)
    }

    /// `{ns}:mesh:{id}` — mesh field-map (also carries terminal counters).
    pub fn mesh(&self, mesh: &MeshId) -> String {
        format!("{}:mesh:{}", self.ns, mesh)
    }

    /// `{ns}:mesh:{id}:members` — server membership set.
    pub fn mesh_members(&self, mesh: &MeshId) -> String {
        format!("{}:mesh:{}:members", self.ns, mesh)
    }

    /// `{ns}:server:{id}` — server registry field-map with heartbeat TTL.
    pub fn server(&self, server: &ServerId) -> String {
        format!("{}:server:{}", self.ns, server)
    }

    /// `{ns}:workers` — set of server ids that have ever claimed; drives the
    /// stall scan.
    pub fn worker_registry(&self) -> String {
        format!("{}:workers", self.ns)
    }

    /// `{ns}:idempotency:{key}` — idempotency key → jobId, with TTL.
    pub fn idempotency(&self, key: &str) -> String {
        format!("{}:idempotency:{}", self.ns, key)
    }

    /// `{ns}:fingerprint:{hash}` — content hash → jobId, with TTL.
    pub fn fingerprint(&self, hash: &str) -> String {
        format!("{}:fingerprint:{}", self.ns, hash)
    }

    /// `{ns}:ratelimit:{key}` — fixed-window counter.
    pub fn ratelimit(&self, key: &str) -> String {
        format!("{}:ratelimit:{}", self.ns, key)
    }

    /// `{ns}:ratelimitqueue:{key}` — overflow list.
    pub fn ratelimit_queue(&self, key: &str) -> String {
        format!("{}:ratelimitqueue:{}", self.ns, key)
    }

    /// `{ns}:ratelimitconcurrent:{key}` — active-jobs gauge per bucket.
    pub fn ratelimit_concurrent(&self, key: &str) -> String {
        format!("{}:ratelimitconcurrent:{}", self.ns, key)
    }

    /// `{ns}:batch:{id}` — batch meta field-map.
    pub fn batch(&self, batch: &BatchId) -> String {
        format!("{}:batch:{}", self.ns, batch)
    }

    /// `{ns}:batch:{id}:jobs` — member list of a finalized batch.
    pub fn batch_jobs(&self, batch: &BatchId) -> String {
        format!("{}:batch:{}:jobs", self.ns, batch)
    }

    /// `{ns}:batchacc:{meshId}:{type}` — accumulation list before
    /// finalization.
    pub fn batch_accumulator(&self, mesh: &MeshId, job_type: &str) -> String {
        format!("{}:batchacc:{}:{}", self.ns, mesh, job_type)
    }

    /// `{ns}:events:{scope}` — pub/sub channel.
    pub fn events_channel(&self, suffix: &str) -> String {
        format!("{}:events:{}", self.ns, suffix)
    }

    /// SCAN pattern matching every job meta key; used by the cleaner.
    pub fn job_meta_scan_pattern(&self) -> String {
        format!("{}:job:*:meta", self.ns)
    }

    /// SCAN pattern matching every server registry key.
    pub fn server_scan_pattern(&self) -> String {
        format!("{}:server:*", self.ns)
    }

    /// Extract the job id from a `{ns}:job:{id}:meta` key.
    pub fn job_id_from_meta_key(&self, key: &str) -> Option<JobId> {
        let rest = key.strip_prefix(&format!("{}:job:", self.ns))?;
        let id = rest.strip_suffix(":meta")?;
        (!id.is_empty()).then(|| JobId::from_string(id))
    }

    /// Extract the server id from a `{ns}:server:{id}` key.
    pub fn server_id_from_key(&self, key: &str) -> Option<ServerId> {
        let rest = key.strip_prefix(&format!("{}:server:", self.ns))?;
        (!rest.is_empty()).then(|| ServerId::from_string(rest))
    }

    /// The `{type}:{priority}` member stored in the queue registry set.
    pub fn queue_registry_member(job_type: &str, priority: u8) -> String {
        format!("{job_type}:{priority}")
    }

    /// Parse a queue registry member back into `(type, priority)`.
    pub fn parse_queue_registry_member(member: &str) -> Option<(String, u8)> {
        let (job_type, prio) = member.rsplit_once(':')?;
        let priority = prio.parse().ok()?;
        (!job_type.is_empty()).then(|| (job_type.to_string(), priority))
    }
}
