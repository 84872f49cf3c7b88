//! Role-specific lifecycle hooks
//!
//! The registry drives the state machine; hooks carry the side effects a
//! role needs at each transition. Session containers release their disk
//! slot and write a usage-accounting record before deletion, optionally
//! snapshotting the slot contents to archive storage first.

use crate::caps::{async_trait, BucketStore};
use crate::models::ContainerDetail;
use crate::naming;
use crate::slots::SlotAllocator;
use crate::store::{record_session_time, SessionProps, Store, UsageRecord};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Side effects of container state transitions.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Runs after a disk slot is reserved and before the container is
    /// created; session hooks restore the owner's latest snapshot into
    /// the slot here.
    async fn before_create(&self, name: &str, slot: u32) -> Result<()> {
        let _ = (name, slot);
        Ok(())
    }
    async fn on_start(&self, detail: &ContainerDetail) -> Result<()>;
    async fn on_stop(&self, detail: &ContainerDetail) -> Result<()>;
    async fn on_restart(&self, detail: &ContainerDetail) -> Result<()>;
    async fn on_kill(&self, detail: &ContainerDetail) -> Result<()>;
    /// Runs before the container is removed from the runtime. Must
    /// release any attached disk slot and record usage accounting;
    /// `backup` asks for a snapshot of the slot contents first.
    async fn before_delete(&self, detail: &ContainerDetail, backup: bool) -> Result<()>;
}

/// One file in a slot snapshot, content hex-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct ArchiveEntry {
    path: String,
    data: String,
}

/// Serialize a directory tree into a deterministic snapshot blob.
fn snapshot_dir(root: &Path) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("could not read {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path
                    .strip_prefix(root)?
                    .to_string_lossy()
                    .into_owned();
                let data = hex::encode(std::fs::read(&path)?);
                entries.push(ArchiveEntry { path: rel, data });
            }
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(serde_json::to_vec(&entries)?)
}

/// Unpack a snapshot blob into a slot directory.
fn restore_dir(root: &Path, blob: &[u8]) -> Result<()> {
    let entries: Vec<ArchiveEntry> = serde_json::from_slice(blob).context("corrupt snapshot")?;
    for entry in entries {
        let rel = Path::new(&entry.path);
        if rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            anyhow::bail!("unsafe path in snapshot: {}", entry.path);
        }
        let path = root.join(rel);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create {}", dir.display()))?;
        }
        let data = hex::decode(&entry.data).context("corrupt snapshot entry")?;
        std::fs::write(&path, data)
            .with_context(|| format!("could not write {}", path.display()))?;
    }
    Ok(())
}

/// Hooks for per-user session containers.
pub struct SessionHooks {
    slots: Arc<SlotAllocator>,
    store: Arc<dyn Store>,
    bucket: Arc<dyn BucketStore>,
    backup_bucket: String,
}

impl SessionHooks {
    pub fn new(
        slots: Arc<SlotAllocator>,
        store: Arc<dyn Store>,
        bucket: Arc<dyn BucketStore>,
        backup_bucket: impl Into<String>,
    ) -> Self {
        Self {
            slots,
            store,
            bucket,
            backup_bucket: backup_bucket.into(),
        }
    }

    async fn backup_slot(&self, name: &str, slot: u32) -> Result<()> {
        let root: PathBuf = self.slots.slot_path(slot);
        let bytes = tokio::task::spawn_blocking(move || snapshot_dir(&root))
            .await
            .context("snapshot task aborted")??;
        let key = format!("{name}.snapshot.json");
        self.bucket
            .push(&self.backup_bucket, &key, bytes)
            .await
            .context("archive push failed")?;

        let mut props = SessionProps::load(self.store.as_ref(), name)
            .await?
            .unwrap_or(SessionProps {
                owner: String::new(),
                snapshot_key: None,
            });
        props.snapshot_key = Some(key.clone());
        props.save(self.store.as_ref(), name).await?;
        info!(session = name, %key, "session snapshot stored");
        Ok(())
    }
}

#[async_trait]
impl LifecycleHooks for SessionHooks {
    async fn before_create(&self, name: &str, slot: u32) -> Result<()> {
        let Some(props) = SessionProps::load(self.store.as_ref(), name).await? else {
            return Ok(());
        };
        let Some(key) = props.snapshot_key else {
            return Ok(());
        };
        let Some(blob) = self.bucket.fetch(&self.backup_bucket, &key).await? else {
            warn!(session = name, %key, "recorded snapshot missing from archive");
            return Ok(());
        };

        let root = self.slots.slot_path(slot);
        tokio::task::spawn_blocking(move || restore_dir(&root, &blob))
            .await
            .context("restore task aborted")??;
        info!(session = name, %key, slot, "session snapshot restored");
        Ok(())
    }

    async fn on_start(&self, detail: &ContainerDetail) -> Result<()> {
        debug!(name = %detail.name, "session started");
        Ok(())
    }

    async fn on_stop(&self, detail: &ContainerDetail) -> Result<()> {
        debug!(name = %detail.name, "session stopped");
        Ok(())
    }

    async fn on_restart(&self, detail: &ContainerDetail) -> Result<()> {
        debug!(name = %detail.name, "session restarted");
        Ok(())
    }

    async fn on_kill(&self, detail: &ContainerDetail) -> Result<()> {
        warn!(name = %detail.name, "session killed");
        Ok(())
    }

    async fn before_delete(&self, detail: &ContainerDetail, backup: bool) -> Result<()> {
        let name = naming::normalize(&detail.name).to_string();
        for mount in &detail.mounts {
            let Some(slot) = self.slots.slot_id_for_path(&mount.source) else {
                continue;
            };
            if backup {
                // a failed backup is logged data loss, never a reason to
                // keep the slot and container alive
                if let Err(err) = self.backup_slot(&name, slot).await {
                    warn!(session = %name, slot, error = %err, "session backup failed");
                }
            }
            self.slots.release(slot);
        }

        let record = UsageRecord {
            session: name,
            image: detail.image.clone(),
            created: detail.created,
            finished: Utc::now(),
        };
        record_session_time(self.store.as_ref(), &record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MountPoint;
    use crate::slots::SlotConfig;
    use crate::store::MemoryStore;
    use dashmap::DashMap;
    use std::time::Duration;

    struct MockBucket {
        objects: DashMap<(String, String), Vec<u8>>,
    }

    #[async_trait]
    impl BucketStore for MockBucket {
        async fn push(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
            self.objects
                .insert((bucket.to_string(), key.to_string()), data);
            Ok(())
        }

        async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|o| o.clone()))
        }
    }

    fn detail(name: &str, mounts: Vec<MountPoint>) -> ContainerDetail {
        ContainerDetail {
            id: "cid".to_string(),
            name: name.to_string(),
            image: "session:latest".to_string(),
            created: Utc::now(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            running: false,
            restarting: false,
            ports: vec![],
            mounts,
            cpu_shares: 1024,
            memory_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_delete_hook_backs_up_and_releases_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let slots = Arc::new(SlotAllocator::new(SlotConfig {
            capacity: 2,
            lease: Duration::from_secs(120),
            mount_root: tmp.path().to_path_buf(),
        }));
        let slot = slots.reserve().unwrap();
        let slot_dir = slots.slot_path(slot);
        std::fs::create_dir_all(slot_dir.join("work")).unwrap();
        std::fs::write(slot_dir.join("notes.txt"), b"hello").unwrap();
        std::fs::write(slot_dir.join("work/a.dat"), b"data").unwrap();

        let store = Arc::new(MemoryStore::new());
        let bucket = Arc::new(MockBucket {
            objects: DashMap::new(),
        });
        let hooks = SessionHooks::new(
            Arc::clone(&slots),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bucket) as Arc<dyn BucketStore>,
            "backups",
        );

        let detail = detail(
            "/_abc_0",
            vec![MountPoint {
                source: slot_dir.display().to_string(),
                destination: "/home/user".to_string(),
            }],
        );
        hooks.before_delete(&detail, true).await.unwrap();

        // slot returned to the pool
        assert_eq!(slots.used_percent(), 0.0);

        // snapshot landed in the bucket and is recorded in the props
        let props = SessionProps::load(store.as_ref(), "_abc_0")
            .await
            .unwrap()
            .unwrap();
        let key = props.snapshot_key.unwrap();
        let blob = bucket.fetch("backups", &key).await.unwrap().unwrap();
        let entries: Vec<ArchiveEntry> = serde_json::from_slice(&blob).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["notes.txt", "work/a.dat"]);
        assert_eq!(entries[0].data, hex::encode(b"hello"));
    }

    #[tokio::test]
    async fn test_delete_without_backup_still_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let slots = Arc::new(SlotAllocator::new(SlotConfig {
            capacity: 1,
            lease: Duration::from_secs(120),
            mount_root: tmp.path().to_path_buf(),
        }));
        let slot = slots.reserve().unwrap();

        let store = Arc::new(MemoryStore::new());
        let bucket = Arc::new(MockBucket {
            objects: DashMap::new(),
        });
        let hooks = SessionHooks::new(
            Arc::clone(&slots),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bucket) as Arc<dyn BucketStore>,
            "backups",
        );

        let detail = detail(
            "/_abc_0",
            vec![MountPoint {
                source: slots.slot_path(slot).display().to_string(),
                destination: "/home/user".to_string(),
            }],
        );
        hooks.before_delete(&detail, false).await.unwrap();

        assert_eq!(slots.used_percent(), 0.0);
        assert!(bucket.objects.is_empty());
    }

    #[tokio::test]
    async fn test_failed_backup_does_not_block_release() {
        let tmp = tempfile::tempdir().unwrap();
        let slots = Arc::new(SlotAllocator::new(SlotConfig {
            capacity: 1,
            lease: Duration::from_secs(120),
            mount_root: tmp.path().to_path_buf(),
        }));
        let slot = slots.reserve().unwrap();
        // slot directory never created: snapshot will fail

        let hooks = SessionHooks::new(
            Arc::clone(&slots),
            Arc::new(MemoryStore::new()),
            Arc::new(MockBucket {
                objects: DashMap::new(),
            }),
            "backups",
        );

        let detail = detail(
            "/_abc_0",
            vec![MountPoint {
                source: slots.slot_path(slot).display().to_string(),
                destination: "/home/user".to_string(),
            }],
        );
        hooks.before_delete(&detail, true).await.unwrap();
        assert_eq!(slots.used_percent(), 0.0);
    }

    #[tokio::test]
    async fn test_backup_restores_into_a_fresh_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let slots = Arc::new(SlotAllocator::new(SlotConfig {
            capacity: 2,
            lease: Duration::from_secs(120),
            mount_root: tmp.path().to_path_buf(),
        }));
        let store = Arc::new(MemoryStore::new());
        let bucket = Arc::new(MockBucket {
            objects: DashMap::new(),
        });
        let hooks = SessionHooks::new(
            Arc::clone(&slots),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bucket) as Arc<dyn BucketStore>,
            "backups",
        );

        let slot = slots.reserve().unwrap();
        let slot_dir = slots.slot_path(slot);
        std::fs::create_dir_all(slot_dir.join("work")).unwrap();
        std::fs::write(slot_dir.join("notes.txt"), b"hello").unwrap();
        std::fs::write(slot_dir.join("work/a.dat"), b"data").unwrap();

        let detail = detail(
            "/_abc_0",
            vec![MountPoint {
                source: slot_dir.display().to_string(),
                destination: "/home/user".to_string(),
            }],
        );
        hooks.before_delete(&detail, true).await.unwrap();

        // the next launch gets an empty slot directory back
        std::fs::remove_dir_all(&slot_dir).unwrap();
        std::fs::create_dir_all(&slot_dir).unwrap();
        let slot = slots.reserve().unwrap();
        hooks.before_create("_abc_0", slot).await.unwrap();

        let restored = slots.slot_path(slot);
        assert_eq!(
            std::fs::read(restored.join("notes.txt")).unwrap(),
            b"hello"
        );
        assert_eq!(std::fs::read(restored.join("work/a.dat")).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_create_hook_is_a_noop_without_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let slots = Arc::new(SlotAllocator::new(SlotConfig {
            capacity: 1,
            lease: Duration::from_secs(120),
            mount_root: tmp.path().to_path_buf(),
        }));
        let hooks = SessionHooks::new(
            Arc::clone(&slots),
            Arc::new(MemoryStore::new()),
            Arc::new(MockBucket {
                objects: DashMap::new(),
            }),
            "backups",
        );

        let slot = slots.reserve().unwrap();
        hooks.before_create("_abc_0", slot).await.unwrap();
        assert!(std::fs::read_dir(slots.slot_path(slot))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true));
    }
}
