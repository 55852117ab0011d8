//! Store error types.

use bridgemq_models::ErrorCode;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection pool exhausted after {0:?}")]
    PoolExhausted(std::time::Duration),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Not the owner of job {job_id} (owner: {owner:?})")]
    NotOwner {
        job_id: String,
        owner: Option<String>,
    },

    #[error("Unexpected script reply: {0}")]
    ScriptReply(String),

    #[error("Event publish failed: {0}")]
    EventPublish(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn script_reply(msg: impl Into<String>) -> Self {
        Self::ScriptReply(msg.into())
    }

    /// The wire-visible error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Validation(_) => ErrorCode::InvalidConfig,
            StoreError::JobNotFound(_) => ErrorCode::JobNotFound,
            StoreError::NotOwner { .. } => ErrorCode::InvalidTransition,
            StoreError::EventPublish(_) => ErrorCode::EventPublishFailure,
            StoreError::ScriptReply(_) => ErrorCode::StorageReadFailure,
            StoreError::ConnectionFailed(_)
            | StoreError::PoolExhausted(_)
            | StoreError::Redis(_)
            | StoreError::Pool(_) => ErrorCode::RedisFailure,
            StoreError::Json(_) => ErrorCode::InvalidPayload,
        }
    }
}
