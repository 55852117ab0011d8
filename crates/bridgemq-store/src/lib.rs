//! Redis state layer for BridgeMQ.
//!
//! This crate owns everything that touches the store:
//! - the key schema segmenting one Redis instance under a namespace prefix
//! - the connection pool and the dedicated pub/sub client
//! - the atomic Lua scripts that perform every multi-key state transition
//! - the typed repository producers, workers, and maintenance loops call
//! - queue topology introspection, the fixed-window rate limiter, and the
//!   lifecycle event bus

pub mod error;
pub mod events;
pub mod keys;
pub mod meta;
pub mod pool;
pub mod ratelimit;
pub mod repository;
pub mod scripts;
pub mod topology;

pub use error::{StoreError, StoreResult};
pub use events::{EventBus, EventStream};
pub use keys::Keys;
pub use pool::{now_ms, Store, StoreConfig};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use repository::{
    fingerprint_hash, CancelOutcome, ClaimRequest, CompleteOutcome, CreateReceipt, DedupReason,
    FinalizeOutcome, JobRepository, PromoteOutcome, RetryOutcome, StallOutcome,
    CLAIM_SCAN_LIMIT, DEFAULT_DEDUP_WINDOW_SECS, DEFAULT_SERVER_TTL_SECS,
};
pub use topology::{QueueStats, Topology};
