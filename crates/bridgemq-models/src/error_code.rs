//! Wire-visible error codes, grouped by thousands.

use serde::{Deserialize, Serialize};

/// Numeric error codes carried on job error records and surfaced to
/// operators. Grouping: 1xxx validation, 2xxx lifecycle, 3xxx worker,
/// 4xxx routing, 5xxx rate-limit, 6xxx dependencies, 7xxx workflow,
/// 8xxx security, 9xxx storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidConfig,
    InvalidJobType,
    JobNotFound,
    InvalidTransition,
    WorkerShutdown,
    HandlerPanic,
    WorkerCapabilityMismatch,
    NoMatchingWorker,
    RateLimitExceeded,
    DependencyFailed,
    WorkflowFailed,
    Unauthorized,
    RedisFailure,
    StorageWriteFailure,
    StorageReadFailure,
    EventPublishFailure,
    /// A code we do not recognize; preserved verbatim.
    Other(u16),
}

impl ErrorCode {
    /// The numeric wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::InvalidPayload => 1001,
            ErrorCode::InvalidConfig => 1002,
            ErrorCode::InvalidJobType => 1003,
            ErrorCode::JobNotFound => 2001,
            ErrorCode::InvalidTransition => 2002,
            ErrorCode::WorkerShutdown => 3001,
            ErrorCode::HandlerPanic => 3002,
            ErrorCode::WorkerCapabilityMismatch => 3003,
            ErrorCode::NoMatchingWorker => 4001,
            ErrorCode::RateLimitExceeded => 5001,
            ErrorCode::DependencyFailed => 6001,
            ErrorCode::WorkflowFailed => 7001,
            ErrorCode::Unauthorized => 8001,
            ErrorCode::RedisFailure => 9001,
            ErrorCode::StorageWriteFailure => 9004,
            ErrorCode::StorageReadFailure => 9005,
            ErrorCode::EventPublishFailure => 9006,
            ErrorCode::Other(v) => v,
        }
    }

    /// Validation failures (1xxx) fail fast at creation and are never
    /// retried; 1003 and 3003 are also in the non-retryable set consulted
    /// by the worker's failure classifier.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorCode::InvalidPayload
                | ErrorCode::InvalidConfig
                | ErrorCode::WorkerCapabilityMismatch
        )
    }
}

impl From<u16> for ErrorCode {
    fn from(v: u16) -> Self {
        match v {
            1001 => ErrorCode::InvalidPayload,
            1002 => ErrorCode::InvalidConfig,
            1003 => ErrorCode::InvalidJobType,
            2001 => ErrorCode::JobNotFound,
            2002 => ErrorCode::InvalidTransition,
            3001 => ErrorCode::WorkerShutdown,
            3002 => ErrorCode::HandlerPanic,
            3003 => ErrorCode::WorkerCapabilityMismatch,
            4001 => ErrorCode::NoMatchingWorker,
            5001 => ErrorCode::RateLimitExceeded,
            6001 => ErrorCode::DependencyFailed,
            7001 => ErrorCode::WorkflowFailed,
            8001 => ErrorCode::Unauthorized,
            9001 => ErrorCode::RedisFailure,
            9004 => ErrorCode::StorageWriteFailure,
            9005 => ErrorCode::StorageReadFailure,
            9006 => ErrorCode::EventPublishFailure,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(c: ErrorCode) -> u16 {
        c.as_u16()
    }
}
