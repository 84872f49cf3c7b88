//! Cluster-level decisions
//!
//! Admission control, scale-down eligibility, and advisory leader
//! election, all built on loosely-consistent metrics that may be minutes
//! stale. Every decision path degrades conservatively when metrics are
//! unavailable: treat the cluster as a single node, accept on local load
//! alone, never scale, never terminate.

mod admission;
mod leader;

pub use admission::{AdmissionConfig, AdmissionController};
pub use leader::StoreLeaderElection;

use crate::caps::ClusterMetrics;
use tracing::warn;

/// Name of the published per-node load stat.
pub const STAT_LOAD: &str = "Load";

/// This node's image version relative to the fleet.
///
/// Returns -1 when some fleet member runs a strictly newer image (this
/// node is mid-retirement), +1 when this node is strictly newer than the
/// whole fleet, and 0 otherwise. Unknown versions (ordinal 0) and lookup
/// errors count as "same age"; rolling upgrades must not stall on a
/// metrics hiccup.
pub async fn image_recentness(metrics: &dyn ClusterMetrics) -> i32 {
    let self_id = metrics.instance_id();
    let self_ver = match metrics.image_version(&self_id).await {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "could not read own image version");
            return 0;
        }
    };
    if self_ver == 0 {
        return 0;
    }

    let instances = match metrics.all_instances(None).await {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "could not enumerate instances");
            return 0;
        }
    };

    let mut max_ver = self_ver;
    let mut min_ver = self_ver;
    for id in &instances {
        let ver = metrics.image_version(id).await.unwrap_or(0);
        if ver == 0 {
            continue;
        }
        max_ver = max_ver.max(ver);
        min_ver = min_ver.min(ver);
    }

    if max_ver > self_ver {
        -1
    } else if min_ver < self_ver {
        1
    } else {
        0
    }
}
