//! Bounded storage-slot allocator
//!
//! A fixed pool of loopback-disk device ids shared by session containers.
//! A slot is `leased` for a short window between "decided to use" and the
//! device actually showing up in a container's mount table, `occupied`
//! while mounted, and `free` otherwise. Occupancy is never tracked
//! incrementally: [`SlotAllocator::refresh`] recomputes it from the live
//! containers' mounts, which also reclaims leases that expired unused.
//!
//! The mutex guards O(1) table operations only; no I/O happens under it.

use crate::caps::ContainerRuntime;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    /// Terminal for the launch path: the caller must fail the launch,
    /// never take another owner's slot.
    #[error("no free disk slot")]
    NoFreeSlot,
}

/// Externally visible state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Leased,
    Occupied,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Free,
    Leased { expires_at: Instant },
    Occupied,
}

impl SlotState {
    fn status(&self, now: Instant) -> SlotStatus {
        match self {
            SlotState::Free => SlotStatus::Free,
            // an expired lease is free in every observable sense
            SlotState::Leased { expires_at } if now >= *expires_at => SlotStatus::Free,
            SlotState::Leased { .. } => SlotStatus::Leased,
            SlotState::Occupied => SlotStatus::Occupied,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Pool size N; device ids are 0..N.
    pub capacity: usize,
    /// Soft-hold duration for a fresh reservation.
    pub lease: Duration,
    /// Filesystem root under which slot devices are mounted, one
    /// directory per device id.
    pub mount_root: PathBuf,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            lease: Duration::from_secs(120),
            mount_root: PathBuf::from("/mnt/fleet"),
        }
    }
}

pub struct SlotAllocator {
    cfg: SlotConfig,
    table: Mutex<Vec<SlotState>>,
}

impl SlotAllocator {
    pub fn new(cfg: SlotConfig) -> Self {
        let table = vec![SlotState::Free; cfg.capacity];
        Self {
            cfg,
            table: Mutex::new(table),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    /// Reserve the first free slot, holding it under a lease.
    ///
    /// A slot whose lease expired unused stays unavailable until the next
    /// [`refresh`](Self::refresh) reclaims it.
    pub fn reserve(&self) -> Result<u32, SlotError> {
        let mut table = self.table.lock().expect("slot table mutex poisoned");
        let expires_at = Instant::now() + self.cfg.lease;
        for (idx, slot) in table.iter_mut().enumerate() {
            if matches!(slot, SlotState::Free) {
                *slot = SlotState::Leased { expires_at };
                debug!(slot = idx, "reserved disk slot");
                return Ok(idx as u32);
            }
        }
        Err(SlotError::NoFreeSlot)
    }

    /// Free a slot immediately. Called from the container delete hook,
    /// regardless of whether the content was backed up.
    pub fn release(&self, id: u32) {
        let mut table = self.table.lock().expect("slot table mutex poisoned");
        match table.get_mut(id as usize) {
            Some(slot) => {
                *slot = SlotState::Free;
                debug!(slot = id, "released disk slot");
            }
            None => warn!(slot = id, "release of out-of-range slot id"),
        }
    }

    /// Percentage of slots occupied or under an unexpired lease, in [0, 100].
    pub fn used_percent(&self) -> f64 {
        let table = self.table.lock().expect("slot table mutex poisoned");
        if table.is_empty() {
            return 0.0;
        }
        let now = Instant::now();
        let used = table
            .iter()
            .filter(|s| s.status(now) != SlotStatus::Free)
            .count();
        (used as f64 * 100.0 / table.len() as f64).clamp(0.0, 100.0)
    }

    /// Current status of every slot.
    pub fn snapshot(&self) -> Vec<SlotStatus> {
        let table = self.table.lock().expect("slot table mutex poisoned");
        let now = Instant::now();
        table.iter().map(|s| s.status(now)).collect()
    }

    /// Recompute occupancy from scratch: everything except unexpired
    /// leases is cleared to free, then the given device ids are marked
    /// occupied. This is the single reconciliation point that corrects
    /// for leases never attached and containers that died without a
    /// clean release.
    pub fn apply_refresh(&self, occupied: &[u32]) {
        let mut table = self.table.lock().expect("slot table mutex poisoned");
        let now = Instant::now();
        for slot in table.iter_mut() {
            *slot = match *slot {
                SlotState::Leased { expires_at } if now < expires_at => {
                    SlotState::Leased { expires_at }
                }
                _ => SlotState::Free,
            };
        }
        for id in occupied {
            match table.get_mut(*id as usize) {
                Some(slot) => *slot = SlotState::Occupied,
                None => warn!(slot = id, "mounted device outside slot range"),
            }
        }
        let free = table
            .iter()
            .filter(|s| s.status(now) == SlotStatus::Free)
            .count();
        info!(free, capacity = table.len(), "disk slots refreshed");
    }

    /// Filesystem path of a slot's mount source.
    pub fn slot_path(&self, id: u32) -> PathBuf {
        self.cfg.mount_root.join(id.to_string())
    }

    /// Inverse of [`slot_path`](Self::slot_path): the device id a mount
    /// source under the configured root refers to.
    pub fn slot_id_for_path(&self, path: &str) -> Option<u32> {
        let rel = Path::new(path).strip_prefix(&self.cfg.mount_root).ok()?;
        rel.components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .and_then(|s| s.parse().ok())
    }

    /// Reconcile the table against the runtime's view of the given live
    /// containers. Inspect failures for individual containers are logged
    /// and treated as "no devices mounted".
    pub async fn refresh(&self, runtime: &dyn ContainerRuntime, live: &[String]) {
        let mut occupied = Vec::new();
        for id in live {
            match runtime.inspect(id).await {
                Ok(detail) => {
                    for mount in &detail.mounts {
                        if let Some(slot) = self.slot_id_for_path(&mount.source) {
                            occupied.push(slot);
                        }
                    }
                }
                Err(err) => {
                    warn!(container_id = %id, error = %err, "error finding disk ids in use");
                }
            }
        }
        self.apply_refresh(&occupied);
    }
}
