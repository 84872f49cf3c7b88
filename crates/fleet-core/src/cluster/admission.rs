//! Per-node admission and scale-down decisions

use super::{image_recentness, STAT_LOAD};
use crate::caps::ClusterMetrics;
use crate::observability::StructuredLogger;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Fleet-average load at which one extra instance is requested.
    pub scale_up_at_load: f64,
    /// Minimum node age before self-termination is considered.
    pub min_uptime_minutes: i64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            scale_up_at_load: 80.0,
            min_uptime_minutes: 90,
        }
    }
}

/// Decides whether this node accepts new sessions and whether it may shut
/// itself down.
///
/// All inputs are eventually consistent. The decision rules are
/// deterministic given the same metrics snapshot, so every node converges
/// on the same accept/redirect target without coordination.
pub struct AdmissionController {
    metrics: Arc<dyn ClusterMetrics>,
    cfg: AdmissionConfig,
    logger: StructuredLogger,
    /// Load figure published this housekeeping cycle, if any. Refreshed
    /// by the orchestrator; falls back to a metrics fetch when absent.
    self_load: Mutex<Option<f64>>,
}

impl AdmissionController {
    pub fn new(metrics: Arc<dyn ClusterMetrics>, cfg: AdmissionConfig) -> Self {
        let logger = StructuredLogger::new(metrics.instance_id());
        Self {
            metrics,
            cfg,
            logger,
            self_load: Mutex::new(None),
        }
    }

    /// Record the load figure computed locally this cycle, so admission
    /// checks don't re-fetch it per request.
    pub fn note_self_load(&self, load: f64) {
        let mut cached = self.self_load.lock().expect("self load mutex poisoned");
        *cached = Some(load);
    }

    async fn self_load(&self) -> f64 {
        {
            let cached = self.self_load.lock().expect("self load mutex poisoned");
            if let Some(v) = *cached {
                return v;
            }
        }
        match self
            .metrics
            .instance_load(&self.metrics.instance_id(), STAT_LOAD)
            .await
        {
            Ok(Some(v)) => {
                let mut cached = self.self_load.lock().expect("self load mutex poisoned");
                *cached = Some(v);
                v
            }
            // unknown load fails closed
            Ok(None) => 100.0,
            Err(err) => {
                warn!(error = %err, "could not read own load");
                100.0
            }
        }
    }

    /// Fleet load map with instances running an older image than this
    /// node dropped. New work is never routed to a node mid-retirement.
    async fn surviving_cluster_load(&self) -> Result<HashMap<String, f64>> {
        let loads = self.metrics.cluster_load(STAT_LOAD).await?;
        let self_ver = self
            .metrics
            .image_version(&self.metrics.instance_id())
            .await
            .unwrap_or(0);
        let mut surviving = HashMap::new();
        for (id, load) in loads {
            let ver = self.metrics.image_version(&id).await.unwrap_or(0);
            if ver >= self_ver {
                surviving.insert(id, load);
            }
        }
        Ok(surviving)
    }

    /// Whether this node takes the next new session.
    pub async fn should_accept_session(&self, is_leader: bool) -> bool {
        let self_load = self.self_load().await;
        let accepted = self.admit(is_leader, self_load).await;
        self.logger.log_admission(accepted, self_load);
        accepted
    }

    async fn admit(&self, is_leader: bool, self_load: f64) -> bool {
        let self_id = self.metrics.instance_id();
        debug!(%self_id, self_load, "session admission check");

        if self_load >= 100.0 {
            info!(self_load, "node saturated, rejecting session");
            return false;
        }

        let cluster = match self.surviving_cluster_load().await {
            Ok(m) => m,
            Err(err) => {
                warn!(error = %err, "cluster metrics unavailable, single node admission");
                return true;
            }
        };

        let avg_load = if cluster.is_empty() {
            None
        } else {
            Some(cluster.values().sum::<f64>() / cluster.len() as f64)
        };

        if let Some(avg) = avg_load {
            if avg >= self.cfg.scale_up_at_load {
                self.logger.log_scale_up(avg);
                let metrics = Arc::clone(&self.metrics);
                tokio::spawn(async move {
                    if let Err(err) = metrics.request_scale_up().await {
                        warn!(error = %err, "scale up request failed");
                    }
                });
            }
        }

        // rolling upgrade gates: the newest image drains traffic toward
        // itself, a retiring image only finishes its existing sessions
        match image_recentness(self.metrics.as_ref()).await {
            r if r > 0 => return true,
            r if r < 0 => {
                info!("image behind cluster max, rejecting session");
                return false;
            }
            _ => {}
        }

        if is_leader {
            return true;
        }

        let Some(avg_load) = avg_load else {
            // first or only instance of a fresh image
            return true;
        };

        let mut candidates: Vec<&String> = if avg_load >= 50.0 {
            // bin-pack before fanning out
            if self_load >= avg_load {
                return true;
            }
            cluster
                .iter()
                .filter(|(_, load)| **load < avg_load)
                .map(|(id, _)| id)
                .collect()
        } else {
            // load too noisy at low utilization; stable arbitrary tie-break
            cluster.keys().collect()
        };
        candidates.sort();
        matches!(candidates.first(), Some(id) if id.as_str() == self_id)
    }

    /// Peer to send a rejected session to, if any. Mirrors the admission
    /// candidate filter so all nodes pick the same target from the same
    /// metrics snapshot.
    pub async fn redirect_instance(&self) -> Option<String> {
        let cluster = match self.surviving_cluster_load().await {
            Ok(m) if !m.is_empty() => m,
            Ok(_) => return None,
            Err(err) => {
                warn!(error = %err, "cluster metrics unavailable, no redirect");
                return None;
            }
        };

        let avg_load = cluster.values().sum::<f64>() / cluster.len() as f64;
        let mut candidates: Vec<&String> = cluster
            .iter()
            .filter(|(_, load)| {
                if avg_load >= 50.0 {
                    **load < avg_load
                } else {
                    **load > avg_load
                }
            })
            .map(|(id, _)| id)
            .collect();
        if candidates.is_empty() {
            candidates = cluster.keys().collect();
        }
        candidates.sort();
        let target = candidates.first().map(|id| id.to_string());
        if let Some(target) = &target {
            self.logger.log_redirect(target);
        }
        target
    }

    /// Whether this node may remove itself from the fleet.
    pub async fn can_terminate(&self, is_leader: bool) -> bool {
        let uptime = match self.metrics.uptime_minutes().await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "could not read uptime, not terminating");
                return false;
            }
        };
        if uptime < self.cfg.min_uptime_minutes {
            return false;
        }
        if is_leader {
            debug!("cluster leader does not terminate");
            return false;
        }
        match image_recentness(self.metrics.as_ref()).await {
            r if r < 0 => {
                // forced retirement of stale images, regardless of load
                info!("image behind cluster max, termination allowed");
                return true;
            }
            r if r > 0 => return false,
            _ => {}
        }
        let instances = match self.metrics.all_instances(None).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "could not enumerate instances, not terminating");
                return false;
            }
        };
        if instances.len() < 2 {
            return false;
        }
        true
    }
}
