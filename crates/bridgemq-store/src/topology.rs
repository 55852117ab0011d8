//! Queue topology introspection.
//!
//! Read-only aggregate views over the queue indexes: pending depth per
//! priority, delayed backlog, per-server active counts, DLQ length, and the
//! mesh's terminal counters. Used by operators and tests; the claim path
//! never goes through here.

use std::collections::HashMap;

use bridgemq_models::{JobStatus, MeshId, ServerId};

use crate::error::StoreResult;
use crate::keys::Keys;
use crate::pool::Store;

/// Aggregate queue state for one mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Jobs per priority across this mesh's priority queues.
    pub pending_by_priority: HashMap<u8, u64>,
    /// Total entries in the pending index.
    pub pending_total: u64,
    /// This mesh's members of the global delayed set cannot be counted
    /// cheaply, so this is the global backlog.
    pub delayed_total: u64,
    pub dlq_len: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
}

/// Read-only topology queries.
pub struct Topology {
    store: std::sync::Arc<Store>,
    keys: Keys,
}

impl Topology {
    pub fn new(store: std::sync::Arc<Store>) -> Self {
        let keys = store.keys();
        Self { store, keys }
    }

    /// Cheap "is anything pending" check against the pending index.
    pub async fn has_pending(&self, mesh: &MeshId) -> StoreResult<bool> {
        let mut conn = self.store.conn().await?;
        let count: u64 = redis::cmd("ZCARD")
            .arg(self.keys.pending_index(mesh))
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    /// Snapshot of a mesh's queues and counters.
    pub async fn stats(&self, mesh: &MeshId) -> StoreResult<QueueStats> {
        let mut conn = self.store.conn().await?;

        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queue_registry(mesh))
            .query_async(&mut conn)
            .await?;

        let mut pending_by_priority: HashMap<u8, u64> = HashMap::new();
        for member in &members {
            if let Some((job_type, priority)) = Keys::parse_queue_registry_member(member) {
                let depth: u64 = redis::cmd("ZCARD")
                    .arg(self.keys.queue(mesh, &job_type, priority))
                    .query_async(&mut conn)
                    .await?;
                *pending_by_priority.entry(priority).or_default() += depth;
            }
        }

        let pending_total: u64 = redis::cmd("ZCARD")
            .arg(self.keys.pending_index(mesh))
            .query_async(&mut conn)
            .await?;
        let delayed_total: u64 = redis::cmd("ZCARD")
            .arg(self.keys.delayed())
            .query_async(&mut conn)
            .await?;
        let dlq_len: u64 = redis::cmd("LLEN")
            .arg(self.keys.dlq(mesh))
            .query_async(&mut conn)
            .await?;

        let mesh_map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.mesh(mesh))
            .query_async(&mut conn)
            .await?;
        let counter = |status: JobStatus| -> u64 {
            mesh_map
                .get(&format!("total:{}", status.as_str()))
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        Ok(QueueStats {
            pending_by_priority,
            pending_total,
            delayed_total,
            dlq_len,
            total_completed: counter(JobStatus::Completed),
            total_failed: counter(JobStatus::Failed),
            total_cancelled: counter(JobStatus::Cancelled),
        })
    }

    /// Number of jobs a worker currently owns.
    pub async fn active_count(&self, server: &ServerId) -> StoreResult<u64> {
        let mut conn = self.store.conn().await?;
        let count: u64 = redis::cmd("HLEN")
            .arg(self.keys.active(server))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// The active map of a worker: job id → claim timestamp.
    pub async fn active_jobs(&self, server: &ServerId) -> StoreResult<HashMap<String, i64>> {
        let mut conn = self.store.conn().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.active(server))
            .query_async(&mut conn)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|(job, ts)| ts.parse().ok().map(|ts| (job, ts)))
            .collect())
    }
}
