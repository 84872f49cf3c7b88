//! Key-value record layer
//!
//! Durable user/session records are consumed through an opaque get/put
//! capability; the concrete backend (relational, NoSQL) is a collaborator.
//! Typed wrappers below cover the records the core itself reads and writes:
//! per-session properties, usage accounting, and the cluster-leader row.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Table names used by the core.
pub mod tables {
    pub const SESSION_PROPS: &str = "session_props";
    pub const USAGE_ACCOUNTING: &str = "usage_accounting";
    pub const DYN_CONFIG: &str = "dyn_config";
}

/// Opaque record store capability.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;
    async fn put(&self, table: &str, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, table: &str, key: &str) -> Result<()>;
}

/// In-memory store, used in single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|r| r.clone()))
    }

    async fn put(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.rows.insert((table.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.rows.remove(&(table.to_string(), key.to_string()));
        Ok(())
    }
}

/// Durable per-session properties, keyed by derived container name.
/// Survives container recreation; this is how an owner keeps the same
/// backup volume across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProps {
    pub owner: String,
    /// Bucket key of the latest home-directory snapshot, if any.
    pub snapshot_key: Option<String>,
}

impl SessionProps {
    pub async fn load(store: &dyn Store, name: &str) -> Result<Option<SessionProps>> {
        match store.get(tables::SESSION_PROPS, name).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &dyn Store, name: &str) -> Result<()> {
        store
            .put(tables::SESSION_PROPS, name, serde_json::to_value(self)?)
            .await
    }
}

/// One usage-accounting record, written when a session container is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub session: String,
    pub image: String,
    pub created: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

pub async fn record_session_time(store: &dyn Store, record: &UsageRecord) -> Result<()> {
    let key = format!("{}:{}", record.session, record.finished.timestamp());
    debug!(session = %record.session, "recording session usage");
    store
        .put(tables::USAGE_ACCOUNTING, &key, serde_json::to_value(record)?)
        .await
}

const LEADER_KEY: &str = "cluster_leader";

/// Read the advisory cluster-leader row.
pub async fn get_cluster_leader(store: &dyn Store) -> Result<Option<String>> {
    match store.get(tables::DYN_CONFIG, LEADER_KEY).await? {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) | None => Ok(None),
    }
}

/// Propose an instance as cluster leader. Last write wins; leadership is
/// advisory, not fenced.
pub async fn set_cluster_leader(store: &dyn Store, instance_id: &str) -> Result<()> {
    store
        .put(tables::DYN_CONFIG, LEADER_KEY, Value::String(instance_id.to_string()))
        .await
}

pub async fn unset_cluster_leader(store: &dyn Store) -> Result<()> {
    store.delete(tables::DYN_CONFIG, LEADER_KEY).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_props_round_trip() {
        let store = MemoryStore::new();
        let props = SessionProps {
            owner: "user@example.org".to_string(),
            snapshot_key: Some("backups/abc.tar.gz".to_string()),
        };
        props.save(&store, "_abc_0").await.unwrap();

        let loaded = SessionProps::load(&store, "_abc_0").await.unwrap().unwrap();
        assert_eq!(loaded.owner, "user@example.org");
        assert_eq!(loaded.snapshot_key.as_deref(), Some("backups/abc.tar.gz"));
    }

    #[tokio::test]
    async fn test_missing_session_props_is_none() {
        let store = MemoryStore::new();
        assert!(SessionProps::load(&store, "_nope_0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_leader_row_set_and_unset() {
        let store = MemoryStore::new();
        assert_eq!(get_cluster_leader(&store).await.unwrap(), None);

        set_cluster_leader(&store, "i-0abc").await.unwrap();
        assert_eq!(
            get_cluster_leader(&store).await.unwrap(),
            Some("i-0abc".to_string())
        );

        unset_cluster_leader(&store).await.unwrap();
        assert_eq!(get_cluster_leader(&store).await.unwrap(), None);
    }
}
