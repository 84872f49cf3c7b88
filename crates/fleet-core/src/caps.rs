//! Capability interfaces consumed by the orchestration core
//!
//! The core never talks to a container runtime, cloud provider, or record
//! store directly. Each of those is an explicit trait implemented by a
//! collaborator and injected at construction time, so every decision path
//! in this crate can run against mock capabilities in tests.

use crate::models::{ContainerDetail, ContainerSpec, ContainerSummary, ImageInfo};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

pub use async_trait::async_trait;

/// Container runtime operations (create/start/stop/kill/remove/inspect/list).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Graceful stop with a bounded wait before the runtime escalates.
    async fn stop(&self, id: &str, timeout_secs: u32) -> Result<()>;
    async fn restart(&self, id: &str, timeout_secs: u32) -> Result<()>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn inspect(&self, id: &str) -> Result<ContainerDetail>;
    /// List containers; `all = false` restricts to running ones.
    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>>;
    async fn list_images(&self) -> Result<Vec<ImageInfo>>;
}

/// Cluster-wide load and instance metadata.
///
/// Figures are eventually consistent and may be minutes stale; callers are
/// expected to fail conservatively when a method errors.
#[async_trait]
pub trait ClusterMetrics: Send + Sync {
    fn instance_id(&self) -> String;

    /// Latest published value of a stat for one instance, if any.
    async fn instance_load(&self, instance_id: &str, stat_name: &str) -> Result<Option<f64>>;

    /// Latest published stat across the fleet, keyed by instance id.
    async fn cluster_load(&self, stat_name: &str) -> Result<HashMap<String, f64>>;

    /// Image/AMI version ordinal for an instance; 0 when unknown.
    async fn image_version(&self, instance_id: &str) -> Result<u64>;

    /// Instance ids in the scaling group (or the whole install).
    async fn all_instances(&self, group: Option<&str>) -> Result<Vec<String>>;

    async fn publish_stat(&self, name: &str, unit: &str, value: f64) -> Result<()>;

    async fn uptime_minutes(&self) -> Result<i64>;

    /// Fire-and-forget request for one more instance. Cooldown is the
    /// provider's responsibility; this is never retried.
    async fn request_scale_up(&self) -> Result<()>;

    /// Remove this node from the scaling group and shut it down.
    async fn terminate_self(&self) -> Result<()>;
}

/// Advisory cluster leadership. Not fenced; briefly-stale answers are
/// tolerated by every caller.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Archive storage for session backups.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn push(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Single-node fallback metrics: no cluster, no scaling, stats kept in
/// memory. Used when the daemon runs outside any scaling group, and as the
/// conservative stand-in wherever real metrics are unavailable.
pub struct SingleNodeMetrics {
    instance_id: String,
    started: Instant,
    stats: Mutex<HashMap<String, f64>>,
}

impl SingleNodeMetrics {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            started: Instant::now(),
            stats: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ClusterMetrics for SingleNodeMetrics {
    fn instance_id(&self) -> String {
        self.instance_id.clone()
    }

    async fn instance_load(&self, instance_id: &str, stat_name: &str) -> Result<Option<f64>> {
        if instance_id != self.instance_id {
            warn!(instance_id, "unknown instance id");
            return Ok(None);
        }
        let stats = self.stats.lock().expect("stats mutex poisoned");
        Ok(stats.get(stat_name).copied())
    }

    async fn cluster_load(&self, stat_name: &str) -> Result<HashMap<String, f64>> {
        let stats = self.stats.lock().expect("stats mutex poisoned");
        let mut out = HashMap::new();
        if let Some(v) = stats.get(stat_name) {
            out.insert(self.instance_id.clone(), *v);
        }
        Ok(out)
    }

    async fn image_version(&self, _instance_id: &str) -> Result<u64> {
        Ok(0)
    }

    async fn all_instances(&self, group: Option<&str>) -> Result<Vec<String>> {
        if let Some(group) = group {
            warn!(group, "unknown compute group");
        }
        Ok(vec![self.instance_id.clone()])
    }

    async fn publish_stat(&self, name: &str, unit: &str, value: f64) -> Result<()> {
        info!(stat = name, unit, value, "publishing stat");
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        stats.insert(name.to_string(), value);
        Ok(())
    }

    async fn uptime_minutes(&self) -> Result<i64> {
        Ok(self.started.elapsed().as_secs() as i64 / 60)
    }

    async fn request_scale_up(&self) -> Result<()> {
        debug!("single node install, ignoring scale-up request");
        Ok(())
    }

    async fn terminate_self(&self) -> Result<()> {
        warn!("can not terminate a single node instance");
        Ok(())
    }
}
