//! Worker side of BridgeMQ: the claim/execute/complete loop, the handler
//! registry, retry-eligibility classification, server heartbeats, and the
//! background maintenance loops (delayed promotion, stall detection,
//! cleaning).

pub mod classify;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod maintenance;
pub mod worker;

pub use classify::{classify_failure, FailureDisposition};
pub use config::{MaintenanceConfig, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use handler::{handler_fn, HandlerOutcome, HandlerRegistry, JobContext, JobHandler};
pub use maintenance::{CleanReport, Maintenance};
pub use worker::{Worker, WorkerEvent};
