//! Server and mesh registry entities.

use serde::{Deserialize, Serialize};

use crate::id::{MeshId, ServerId};

/// Liveness state of a registered server. A server whose registry entry has
/// expired (heartbeat TTL lapsed) is considered dead regardless of this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Online,
    Offline,
    /// Finishing in-flight jobs, not claiming new ones.
    Draining,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "online" => ServerStatus::Online,
            "offline" => ServerStatus::Offline,
            "draining" => ServerStatus::Draining,
            _ => return None,
        })
    }
}

/// A process registered in one or more meshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub server_id: ServerId,
    pub stack: String,
    pub capabilities: Vec<String>,
    pub mesh_ids: Vec<MeshId>,
    pub region: String,
    #[serde(default)]
    pub resources: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: ServerStatus,
    pub last_heartbeat: i64,
    pub current_load: u32,
    pub total_processed: u64,
    pub total_failed: u64,
}

impl Server {
    pub fn new(server_id: impl Into<ServerId>, mesh_id: impl Into<MeshId>) -> Self {
        Self {
            server_id: server_id.into(),
            stack: String::new(),
            capabilities: Vec::new(),
            mesh_ids: vec![mesh_id.into()],
            region: String::new(),
            resources: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            status: ServerStatus::Online,
            last_heartbeat: 0,
            current_load: 0,
            total_processed: 0,
            total_failed: 0,
        }
    }
}

/// A tenant container, auto-created on first server registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mesh {
    pub id: MeshId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_roundtrip() {
        for s in [
            ServerStatus::Online,
            ServerStatus::Offline,
            ServerStatus::Draining,
        ] {
            assert_eq!(ServerStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ServerStatus::parse("zombie"), None);
    }
}
