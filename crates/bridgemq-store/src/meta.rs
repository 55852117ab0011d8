//! Field-map codecs.
//!
//! Job headers and server registry entries are stored as Redis hashes. The
//! field names here are the wire contract shared with the Lua scripts; both
//! sides must agree on them exactly.

use std::collections::HashMap;

use bridgemq_models::{
    BatchId, JobErrorRecord, JobId, JobMeta, JobStatus, MeshId, Server, ServerId, ServerStatus,
};

use crate::error::{StoreError, StoreResult};

/// Decode a job meta hash.
pub fn job_meta_from_map(map: &HashMap<String, String>) -> StoreResult<JobMeta> {
    let field = |name: &str| -> StoreResult<&String> {
        map.get(name)
            .ok_or_else(|| StoreError::script_reply(format!("job meta missing field {name:?}")))
    };

    let status_raw = field("status")?;
    let status = JobStatus::parse(status_raw)
        .ok_or_else(|| StoreError::script_reply(format!("bad job status {status_raw:?}")))?;

    Ok(JobMeta {
        id: JobId::from_string(field("id")?.clone()),
        job_type: field("type")?.clone(),
        version: map.get("version").cloned().unwrap_or_default(),
        mesh_id: MeshId::from_string(field("meshId")?.clone()),
        priority: parse_num(map, "priority")? as u8,
        status,
        attempt: parse_num(map, "attempt")? as u32,
        stalled_count: parse_num(map, "stalledCount")? as u32,
        progress: map
            .get("progress")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0),
        created_at: parse_num(map, "createdAt")?,
        scheduled_for: parse_num(map, "scheduledFor")?,
        claimed_at: parse_opt_num(map, "claimedAt"),
        completed_at: parse_opt_num(map, "completedAt"),
        updated_at: parse_num(map, "updatedAt")?,
        processed_by: map
            .get("processedBy")
            .filter(|s| !s.is_empty())
            .map(|s| ServerId::from_string(s.clone())),
        batch_id: map
            .get("batchId")
            .filter(|s| !s.is_empty())
            .map(|s| BatchId::from_string(s.clone())),
    })
}

fn parse_num(map: &HashMap<String, String>, name: &str) -> StoreResult<i64> {
    map.get(name)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::script_reply(format!("job meta field {name:?} not numeric")))
}

fn parse_opt_num(map: &HashMap<String, String>, name: &str) -> Option<i64> {
    map.get(name).filter(|s| !s.is_empty())?.parse().ok()
}

/// Decode the bounded error-history list.
pub fn errors_from_list(raw: &[String]) -> Vec<JobErrorRecord> {
    raw.iter()
        .filter_map(|entry| serde_json::from_str(entry).ok())
        .collect()
}

/// Encode a server registry entry as hash field pairs.
pub fn server_to_pairs(server: &Server) -> StoreResult<Vec<(&'static str, String)>> {
    Ok(vec![
        ("serverId", server.server_id.to_string()),
        ("stack", server.stack.clone()),
        ("capabilities", serde_json::to_string(&server.capabilities)?),
        ("meshIds", serde_json::to_string(&server.mesh_ids)?),
        ("region", server.region.clone()),
        ("resources", serde_json::to_string(&server.resources)?),
        ("metadata", serde_json::to_string(&server.metadata)?),
        ("status", server.status.as_str().to_string()),
        ("lastHeartbeat", server.last_heartbeat.to_string()),
        ("currentLoad", server.current_load.to_string()),
        ("totalProcessed", server.total_processed.to_string()),
        ("totalFailed", server.total_failed.to_string()),
    ])
}

/// Decode a server registry hash.
pub fn server_from_map(map: &HashMap<String, String>) -> StoreResult<Server> {
    let server_id = map
        .get("serverId")
        .ok_or_else(|| StoreError::script_reply("server entry missing serverId"))?;

    let status_raw = map.get("status").map(String::as_str).unwrap_or("online");
    let status = ServerStatus::parse(status_raw)
        .ok_or_else(|| StoreError::script_reply(format!("bad server status {status_raw:?}")))?;

    Ok(Server {
        server_id: ServerId::from_string(server_id.clone()),
        stack: map.get("stack").cloned().unwrap_or_default(),
        capabilities: parse_json_or_default(map, "capabilities"),
        mesh_ids: parse_json_or_default(map, "meshIds"),
        region: map.get("region").cloned().unwrap_or_default(),
        resources: parse_json_or_default(map, "resources"),
        metadata: parse_json_or_default(map, "metadata"),
        status,
        last_heartbeat: map
            .get("lastHeartbeat")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        current_load: map
            .get("currentLoad")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        total_processed: map
            .get("totalProcessed")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        total_failed: map
            .get("totalFailed")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
    })
}

fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(
    map: &HashMap<String, String>,
    name: &str,
) -> T {
    map.get(name)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}
