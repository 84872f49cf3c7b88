//! Advisory leader election over the record store
//!
//! A single leader row, last write wins. A node proposes itself when the
//! row is empty or names a dead instance, and the proposal takes effect on
//! the next check so near-simultaneous proposers settle on the final
//! writer. A leader running an image behind the cluster max steps down so
//! housekeeping moves to the rollout's newer generation.

use super::image_recentness;
use crate::caps::{async_trait, ClusterMetrics, LeaderElection};
use crate::store::{self, Store};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub struct StoreLeaderElection {
    store: Arc<dyn Store>,
    metrics: Arc<dyn ClusterMetrics>,
}

impl StoreLeaderElection {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<dyn ClusterMetrics>) -> Self {
        Self { store, metrics }
    }

    async fn check(&self) -> Result<bool> {
        let self_id = self.metrics.instance_id();
        let leader = store::get_cluster_leader(self.store.as_ref()).await?;
        let instances = self.metrics.all_instances(None).await?;

        let live_leader = match leader {
            Some(id) if instances.contains(&id) => id,
            _ => {
                // row empty or names a dead instance; propose self and
                // let the proposal take effect next cycle
                if image_recentness(self.metrics.as_ref()).await >= 0 {
                    info!(instance_id = %self_id, "proposing self as cluster leader");
                    store::set_cluster_leader(self.store.as_ref(), &self_id).await?;
                }
                return Ok(false);
            }
        };

        if live_leader == self_id && image_recentness(self.metrics.as_ref()).await < 0 {
            info!("image behind cluster max, stepping down as leader");
            store::unset_cluster_leader(self.store.as_ref()).await?;
            return Ok(false);
        }

        Ok(live_leader == self_id)
    }
}

#[async_trait]
impl LeaderElection for StoreLeaderElection {
    async fn is_leader(&self) -> bool {
        match self.check().await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "leader check failed, assuming follower");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::MockMetrics;
    use crate::store::MemoryStore;

    fn election(store: Arc<MemoryStore>, metrics: MockMetrics) -> StoreLeaderElection {
        StoreLeaderElection::new(store, Arc::new(metrics))
    }

    #[tokio::test]
    async fn test_proposal_takes_effect_next_cycle() {
        let store = Arc::new(MemoryStore::new());
        let el = election(
            Arc::clone(&store),
            MockMetrics::new("i-a").with_loads(&[("i-a", 0.0), ("i-b", 0.0)]),
        );

        // first check writes the row but does not claim leadership yet
        assert!(!el.is_leader().await);
        assert_eq!(
            store::get_cluster_leader(store.as_ref()).await.unwrap(),
            Some("i-a".to_string())
        );
        assert!(el.is_leader().await);
    }

    #[tokio::test]
    async fn test_dead_leader_row_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        store::set_cluster_leader(store.as_ref(), "i-gone")
            .await
            .unwrap();

        let el = election(
            Arc::clone(&store),
            MockMetrics::new("i-a").with_loads(&[("i-a", 0.0), ("i-b", 0.0)]),
        );
        assert!(!el.is_leader().await);
        assert_eq!(
            store::get_cluster_leader(store.as_ref()).await.unwrap(),
            Some("i-a".to_string())
        );
    }

    #[tokio::test]
    async fn test_follower_respects_live_leader() {
        let store = Arc::new(MemoryStore::new());
        store::set_cluster_leader(store.as_ref(), "i-b").await.unwrap();

        let el = election(
            Arc::clone(&store),
            MockMetrics::new("i-a").with_loads(&[("i-a", 0.0), ("i-b", 0.0)]),
        );
        assert!(!el.is_leader().await);
        // row untouched
        assert_eq!(
            store::get_cluster_leader(store.as_ref()).await.unwrap(),
            Some("i-b".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_image_never_proposes() {
        let store = Arc::new(MemoryStore::new());
        let el = election(
            Arc::clone(&store),
            MockMetrics::new("i-a")
                .with_loads(&[("i-a", 0.0), ("i-b", 0.0)])
                .with_versions(&[("i-a", 3), ("i-b", 5)]),
        );
        assert!(!el.is_leader().await);
        assert_eq!(store::get_cluster_leader(store.as_ref()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_leader_steps_down() {
        let store = Arc::new(MemoryStore::new());
        store::set_cluster_leader(store.as_ref(), "i-a").await.unwrap();

        let el = election(
            Arc::clone(&store),
            MockMetrics::new("i-a")
                .with_loads(&[("i-a", 0.0), ("i-b", 0.0)])
                .with_versions(&[("i-a", 3), ("i-b", 5)]),
        );
        assert!(!el.is_leader().await);
        assert_eq!(store::get_cluster_leader(store.as_ref()).await.unwrap(), None);
    }
}
