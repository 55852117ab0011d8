//! Lifecycle event records published on the store's pub/sub channels.
//!
//! One flat record with optional event-specific fields. Receivers tolerate
//! unknown fields, so the set can grow without breaking old subscribers.

use serde::{Deserialize, Serialize};

use crate::id::{BatchId, JobId, MeshId, ServerId};
use crate::job::JobStatus;

/// The event name carried in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.scheduled")]
    JobScheduled,
    #[serde(rename = "job.claimed")]
    JobClaimed,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "job.retry")]
    JobRetry,
    #[serde(rename = "job.stalled")]
    JobStalled,
    #[serde(rename = "batch.created")]
    BatchCreated,
    #[serde(rename = "ratelimit.exceeded")]
    RateLimitExceeded,
}

/// A published lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_id: Option<MeshId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// Milliseconds between claim and completion, on terminal events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<i64>,
    /// Waiters unblocked by a completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered: Option<Vec<JobId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Rate-limit bucket key on `ratelimit.exceeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl LifecycleEvent {
    pub fn new(event: EventKind, timestamp: i64) -> Self {
        Self {
            event,
            job_id: None,
            timestamp,
            mesh_id: None,
            job_type: None,
            server_id: None,
            status: None,
            processing_time: None,
            triggered: None,
            reason: None,
            attempt: None,
            next_run: None,
            batch_id: None,
            size: None,
            key: None,
        }
    }
}

/// A pub/sub channel scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    Global,
    Mesh(MeshId),
    /// Per-job terminal events.
    Job(JobId),
    Server(ServerId),
    JobType(String),
}

impl EventScope {
    /// The channel suffix under `{ns}:events:`.
    pub fn suffix(&self) -> String {
        match self {
            EventScope::Global => "global".to_string(),
            EventScope::Mesh(m) => format!("mesh:{m}"),
            EventScope::Job(j) => format!("job:{j}"),
            EventScope::Server(s) => format!("server:{s}"),
            EventScope::JobType(t) => format!("type:{t}"),
        }
    }
}
