//! Core data models for the orchestration core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a container on this node, encoded in its derived name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    /// Per-user ephemeral compute session
    Session,
    /// API worker serving queued API requests
    ApiWorker,
    /// Internal service container (never treated as user work)
    Internal,
}

/// One entry from the runtime's container listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    /// Primary name as reported by the runtime (may carry a leading slash)
    pub name: Option<String>,
    /// Human status string, e.g. "Up 2 hours"
    pub status: String,
    pub image: String,
}

/// Host-port binding for one exposed container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// One mounted path inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub source: String,
    pub destination: String,
}

/// Full inspect record for one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub running: bool,
    pub restarting: bool,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<MountPoint>,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
}

impl ContainerDetail {
    /// A container counts as active while running or mid-restart.
    pub fn is_active(&self) -> bool {
        self.running || self.restarting
    }

    /// Host ports bound for the given container ports, in argument order.
    /// `None` if any requested port has no binding.
    pub fn host_ports(&self, container_ports: &[u16]) -> Option<Vec<u16>> {
        container_ports
            .iter()
            .map(|p| {
                self.ports
                    .iter()
                    .find(|b| b.container_port == *p)
                    .map(|b| b.host_port)
            })
            .collect()
    }
}

/// Bind-mount request for container creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Creation request handed to the container runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    /// Container ports to expose; host ports are runtime-assigned
    pub ports: Vec<u16>,
    pub binds: Vec<BindMount>,
}

/// One image known to the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
}
