//! The job entity and its state machine.

use serde::{Deserialize, Serialize};

use crate::config::JobConfig;
use crate::error_code::ErrorCode;
use crate::id::{BatchId, JobId, MeshId, ServerId};

/// Errors kept per job are capped at the most recent ten.
pub const MAX_ERROR_HISTORY: usize = 10;

/// Job state in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the delayed set or on unsatisfied dependencies.
    Scheduled,
    /// Sitting in a priority queue, claimable.
    #[default]
    Pending,
    /// Claimed by a worker; `processedBy` names the owner.
    Active,
    /// Folded into a batch; the batch id is claimable instead.
    Batched,
    /// Finished successfully.
    Completed,
    /// Terminally failed (retries exhausted, stall limit, or ineligible).
    Failed,
    /// Cancelled before execution.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Batched => "batched",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => JobStatus::Scheduled,
            "pending" => JobStatus::Pending,
            "active" => JobStatus::Active,
            "batched" => JobStatus::Batched,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }

    /// Terminal states hold no queue position.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States from which cancellation is permitted.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled)
    }
}

/// One entry in a job's bounded error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorRecord {
    pub code: ErrorCode,
    pub message: String,
    /// Explicit override of code-based retry classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Attempt number the failure occurred on.
    #[serde(default)]
    pub attempt: u32,
    /// Millisecond timestamp of the failure.
    #[serde(default)]
    pub at: i64,
}

impl JobErrorRecord {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
            attempt: 0,
            at: 0,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

/// Header fields of a job, stored as the meta field-map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub id: JobId,
    pub job_type: String,
    pub version: String,
    pub mesh_id: MeshId,
    pub priority: u8,
    pub status: JobStatus,
    pub attempt: u32,
    pub stalled_count: u32,
    /// 0..=100.
    pub progress: f64,
    pub created_at: i64,
    pub scheduled_for: i64,
    #[serde(default)]
    pub claimed_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    /// Worker id owning the lock; empty when unlocked.
    #[serde(default)]
    pub processed_by: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

/// A fully assembled job: header plus the blobs and indexes stored beside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub meta: JobMeta,
    pub config: JobConfig,
    /// Opaque payload bytes; the core never inspects them.
    pub payload: Vec<u8>,
    pub result: Option<serde_json::Value>,
    pub errors: Vec<JobErrorRecord>,
    /// Unsatisfied dependencies.
    pub depends_on: Vec<JobId>,
    /// Jobs blocked on this one.
    pub waiters: Vec<JobId>,
}

/// Validate a job type identifier: `^[A-Za-z0-9_-]{1,100}$`.
pub fn is_valid_job_type(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 100
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A creation request, before the store assigns queue placement.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub mesh_id: MeshId,
    pub payload: Vec<u8>,
    pub version: String,
    pub config: JobConfig,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, mesh_id: impl Into<MeshId>) -> Self {
        Self {
            job_type: job_type.into(),
            mesh_id: mesh_id.into(),
            payload: Vec::new(),
            version: String::new(),
            config: JobConfig::default(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize a JSON-representable payload.
    pub fn with_json_payload<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_vec(value)?;
        Ok(self)
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Pending,
            JobStatus::Active,
            JobStatus::Batched,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_and_cancellable_sets() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Active.is_terminal());

        assert!(JobStatus::Pending.is_cancellable());
        assert!(JobStatus::Scheduled.is_cancellable());
        assert!(!JobStatus::Active.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
    }

    #[test]
    fn job_type_pattern() {
        assert!(is_valid_job_type("send_email"));
        assert!(is_valid_job_type("Video-Render-2"));
        assert!(!is_valid_job_type(""));
        assert!(!is_valid_job_type("has space"));
        assert!(!is_valid_job_type("dotted.type"));
        assert!(!is_valid_job_type(&"x".repeat(101)));
        assert!(is_valid_job_type(&"x".repeat(100)));
    }

    #[test]
    fn error_record_json_shape() {
        let rec = JobErrorRecord::new(ErrorCode::RedisFailure, "connection reset")
            .with_retryable(true);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["code"], 9001);
        assert_eq!(json["retryable"], true);
    }
}
