//! Shared data model for the BridgeMQ task-queue broker.
//!
//! This crate is pure data: typed identifiers, the job state machine,
//! enumerated job configuration, routing targets, backoff math, lifecycle
//! event records, and the wire-visible error-code taxonomy. It performs no
//! I/O; the store and worker crates build on these types.

pub mod backoff;
pub mod config;
pub mod error_code;
pub mod event;
pub mod id;
pub mod job;
pub mod routing;
pub mod server;

pub use backoff::{backoff_delay_ms, jittered_delay_ms};
pub use config::{
    Backoff, BehaviorConfig, ChainConfig, DependenciesConfig, IdempotencyConfig, JobConfig,
    JobTemplate, LifecycleConfig, MatchMode, RateLimitConfig, RetryConfig, Schedule, TargetConfig,
    DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
pub use error_code::ErrorCode;
pub use event::{EventKind, EventScope, LifecycleEvent};
pub use id::{BatchId, JobId, MeshId, ServerId};
pub use job::{Job, JobErrorRecord, JobMeta, JobStatus, NewJob, is_valid_job_type};
pub use routing::WorkerProfile;
pub use server::{Mesh, Server, ServerStatus};
