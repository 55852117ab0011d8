//! Fixed-window rate limiter.
//!
//! One counter per bucket key, incremented while the window has room; the
//! first hit of a window sets its TTL. Saturated checks can park a job id on
//! the bucket's overflow list for a later drain.

use bridgemq_models::JobId;

use crate::error::StoreResult;
use crate::keys::Keys;
use crate::pool::Store;
use crate::scripts::Scripts;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Window room left after this check.
    pub remaining: u32,
    /// Millisecond timestamp when the window resets.
    pub reset_at: i64,
}

/// Client for the fixed-window counters.
pub struct RateLimiter {
    store: std::sync::Arc<Store>,
    keys: Keys,
    scripts: Scripts,
}

impl RateLimiter {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        let keys = store.keys();
        Self {
            store,
            keys,
            scripts: Scripts::new(),
        }
    }

    /// Consume one unit of the bucket's window if it has room.
    pub async fn check(
        &self,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        now_ms: i64,
    ) -> StoreResult<RateLimitDecision> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .rate_limit(
                &mut conn,
                self.keys.namespace(),
                bucket,
                max,
                window_seconds,
                None,
                now_ms,
            )
            .await
    }

    /// Like [`check`](Self::check), but a saturated window parks the job id
    /// on the bucket's overflow list.
    pub async fn check_and_queue(
        &self,
        bucket: &str,
        max: u32,
        window_seconds: u32,
        job_id: &JobId,
        now_ms: i64,
    ) -> StoreResult<RateLimitDecision> {
        let mut conn = self.store.conn().await?;
        self.scripts
            .rate_limit(
                &mut conn,
                self.keys.namespace(),
                bucket,
                max,
                window_seconds,
                Some(job_id),
                now_ms,
            )
            .await
    }

    /// Length of a bucket's overflow list.
    pub async fn overflow_len(&self, bucket: &str) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let len: u64 = redis::cmd("LLEN")
            .arg(self.keys.ratelimit_queue(bucket))
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    /// Pop up to `count` parked job ids from a bucket's overflow list.
    /// The repository's `drain_overflow` re-enqueues them.
    pub async fn pop_overflow(&self, bucket: &str, count: usize) -> StoreResult<Vec<JobId>> {
        let mut conn = self.store.conn().await?;
        let mut popped = Vec::with_capacity(count);
        for _ in 0..count {
            let id: Option<String> = redis::cmd("LPOP")
                .arg(self.keys.ratelimit_queue(bucket))
                .query_async(&mut conn)
                .await?;
            match id {
                Some(id) => popped.push(JobId::from_string(id)),
                None => break,
            }
        }
        Ok(popped)
    }
}
