//! Container registry and lifecycle state machine
//!
//! Tracks the session containers on this node: launch, liveness pings,
//! the periodic maintenance sweep, and the name-to-id index the request
//! path uses to validate session tokens without touching the runtime.
//!
//! States run `absent -> created -> running <-> restarting -> stopped ->
//! deleted`; `kill` forces running to stopped when a graceful stop times
//! out. Every transition invokes the role hooks in [`hooks`].
//!
//! The sweep never performs destructive work inline. Anything that
//! stops or deletes a container is enqueued through the task scheduler,
//! so a slow container cannot stall the sweep, and duplicate scheduling
//! across overlapping sweeps is coalesced downstream by task signature.

mod hooks;

pub use hooks::{LifecycleHooks, SessionHooks};

use crate::caps::ContainerRuntime;
use crate::models::{BindMount, ContainerDetail, ContainerRole, ContainerSpec};
use crate::naming;
use crate::queue::{BackupCleanupArgs, Command, DeleteArgs, TaskScheduler};
use crate::slots::SlotAllocator;
use crate::store::{SessionProps, Store};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Image for new session containers.
    pub image: String,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    /// Container ports to expose; host ports are runtime-assigned.
    pub ports: Vec<u16>,
    /// Mount point of the session's disk slot inside the container.
    pub home_mount: String,
    /// Seconds the runtime waits on a graceful stop before escalating.
    pub stop_timeout_secs: u32,
    /// Stopped containers older than this are deleted without backup.
    pub delete_stopped_grace: Duration,
    /// Start timestamps older than this are treated as garbage from a
    /// container that never really started.
    pub sane_start_age: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            image: "session:latest".to_string(),
            cpu_shares: 1024,
            memory_bytes: 1 << 30,
            ports: vec![8000],
            home_mount: "/home/user".to_string(),
            stop_timeout_secs: 10,
            delete_stopped_grace: Duration::minutes(10),
            sane_start_age: Duration::days(365),
        }
    }
}

/// One entry of the request-path validation index, refreshed wholesale
/// by each sweep.
#[derive(Debug, Clone)]
struct ValidEntry {
    id: String,
    host_ports: Vec<u16>,
    status: String,
    active: bool,
}

pub struct ContainerRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    hooks: Arc<dyn LifecycleHooks>,
    scheduler: Arc<dyn TaskScheduler>,
    slots: Arc<SlotAllocator>,
    store: Arc<dyn Store>,
    cfg: RegistryConfig,
    /// Best-effort liveness pings keyed by session name. Lost on process
    /// restart; the sweep resynthesizes them from the running set.
    pings: DashMap<String, DateTime<Utc>>,
    /// Read-mostly name index, swapped wholesale each sweep so request
    /// lookups never contend with the sweep.
    valid: RwLock<HashMap<String, ValidEntry>>,
}

impl ContainerRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        hooks: Arc<dyn LifecycleHooks>,
        scheduler: Arc<dyn TaskScheduler>,
        slots: Arc<SlotAllocator>,
        store: Arc<dyn Store>,
        cfg: RegistryConfig,
    ) -> Self {
        Self {
            runtime,
            hooks,
            scheduler,
            slots,
            store,
            cfg,
            pings: DashMap::new(),
            valid: RwLock::new(HashMap::new()),
        }
    }

    /// Record a liveness ping for a session, called from the request
    /// path on user activity.
    pub fn note_ping(&self, name: &str) {
        self.pings
            .insert(naming::normalize(name).to_string(), Utc::now());
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerDetail>> {
        let containers = self.runtime.list(true).await?;
        for summary in containers {
            let Some(cname) = &summary.name else { continue };
            if naming::normalize(cname) == name {
                return Ok(Some(self.runtime.inspect(&summary.id).await?));
            }
        }
        Ok(None)
    }

    async fn create(&self, name: &str, owner: &str) -> Result<String> {
        let slot = self.slots.reserve()?;
        // stale data beats refusing the session: a failed restore leaves
        // the user with a fresh home directory, not a launch error
        if let Err(err) = self.hooks.before_create(name, slot).await {
            warn!(%name, slot, error = %err, "could not restore session snapshot");
        }
        let spec = ContainerSpec {
            name: name.to_string(),
            image: self.cfg.image.clone(),
            env: vec![
                format!("SESSION_NAME={name}"),
                format!("SESSION_OWNER={owner}"),
            ],
            cpu_shares: self.cfg.cpu_shares,
            memory_bytes: self.cfg.memory_bytes,
            ports: self.cfg.ports.clone(),
            binds: vec![BindMount {
                host_path: self.slots.slot_path(slot).display().to_string(),
                container_path: self.cfg.home_mount.clone(),
                read_only: false,
            }],
        };
        let id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(err) => {
                // give the lease back straight away instead of waiting
                // for it to expire
                self.slots.release(slot);
                return Err(err).context("container create failed");
            }
        };

        let mut props = SessionProps::load(self.store.as_ref(), name)
            .await?
            .unwrap_or(SessionProps {
                owner: owner.to_string(),
                snapshot_key: None,
            });
        props.owner = owner.to_string();
        props.save(self.store.as_ref(), name).await?;

        info!(%name, container_id = %id, slot, "session container created");
        Ok(id)
    }

    /// Look up or create the container for a derived name, make sure it
    /// is running, and record a liveness ping.
    pub async fn launch(&self, name: &str, owner: &str, reuse: bool) -> Result<ContainerDetail> {
        let mut existing = self.find_by_name(name).await?;
        if let Some(detail) = &existing {
            if !reuse {
                info!(%name, container_id = %detail.id, "recreating session container");
                self.delete(&detail.id, false).await?;
                existing = None;
            }
        }

        let id = match existing {
            Some(detail) => detail.id,
            None => self.create(name, owner).await?,
        };

        let detail = self.runtime.inspect(&id).await?;
        let detail = if detail.is_active() {
            detail
        } else {
            self.runtime
                .start(&id)
                .await
                .with_context(|| format!("could not start container {id}"))?;
            let started = self.runtime.inspect(&id).await?;
            self.hooks.on_start(&started).await?;
            started
        };

        self.note_ping(name);
        Ok(detail)
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        self.runtime.stop(id, self.cfg.stop_timeout_secs).await?;
        let detail = self.runtime.inspect(id).await?;
        self.hooks.on_stop(&detail).await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.runtime
            .restart(id, self.cfg.stop_timeout_secs)
            .await?;
        let detail = self.runtime.inspect(id).await?;
        self.hooks.on_restart(&detail).await
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.runtime.kill(id).await?;
        let detail = self.runtime.inspect(id).await?;
        self.hooks.on_kill(&detail).await
    }

    /// Stop (escalating to kill), run the delete hook, and remove the
    /// container from the runtime.
    pub async fn delete(&self, id: &str, backup: bool) -> Result<()> {
        let detail = self
            .runtime
            .inspect(id)
            .await
            .with_context(|| format!("no such container {id}"))?;

        if detail.is_active() {
            if let Err(err) = self.runtime.stop(id, self.cfg.stop_timeout_secs).await {
                warn!(container_id = %id, error = %err, "graceful stop failed, killing");
                self.runtime.kill(id).await?;
            }
        }

        let detail = self.runtime.inspect(id).await?;
        if let Err(err) = self.hooks.before_delete(&detail, backup).await {
            // reclamation must not stall on accounting problems
            warn!(container_id = %id, error = %err, "delete hook failed");
        }
        self.runtime.remove(id).await?;

        let name = naming::normalize(&detail.name).to_string();
        self.pings.remove(&name);
        if let Ok(mut valid) = self.valid.write() {
            valid.remove(&name);
        }
        info!(%name, container_id = %id, "session container deleted");
        Ok(())
    }

    /// True only if a container with that name is known to the last
    /// sweep and its bound host ports match exactly. Rejects stale
    /// session tokens after a container was recreated with different
    /// port bindings.
    pub fn is_valid_container(&self, name: &str, expected_ports: &[u16]) -> bool {
        let Ok(valid) = self.valid.read() else {
            return false;
        };
        let Some(entry) = valid.get(naming::normalize(name)) else {
            return false;
        };
        let mut have = entry.host_ports.clone();
        let mut want = expected_ports.to_vec();
        have.sort_unstable();
        want.sort_unstable();
        have == want
    }

    /// Session name to human status string, from the last sweep.
    pub fn session_status(&self) -> HashMap<String, String> {
        match self.valid.read() {
            Ok(valid) => valid
                .iter()
                .map(|(name, entry)| (name.clone(), entry.status.clone()))
                .collect(),
            Err(_) => HashMap::new(),
        }
    }

    /// Number of active sessions as of the last sweep.
    pub fn active_sessions(&self) -> usize {
        match self.valid.read() {
            Ok(valid) => valid.values().filter(|e| e.active).count(),
            Err(_) => 0,
        }
    }

    async fn schedule(&self, cmd: Command, data: serde_json::Value) {
        if let Err(err) = self.scheduler.schedule(cmd, data).await {
            warn!(cmd = ?cmd, error = %err, "could not enqueue maintenance task");
        }
    }

    /// Periodic maintenance sweep over this node's session containers.
    pub async fn maintain(&self, max_lifetime: Duration, inactivity_timeout: Duration) -> Result<()> {
        let now = Utc::now();
        let containers = self
            .runtime
            .list(true)
            .await
            .context("could not list containers")?;

        let mut new_valid = HashMap::new();
        let mut live_ids = Vec::new();
        let mut seen_names = Vec::new();

        for summary in containers {
            let Some(raw_name) = &summary.name else { continue };
            let name = naming::normalize(raw_name).to_string();
            if naming::role_of(&name) != ContainerRole::Session {
                continue;
            }
            let detail = match self.runtime.inspect(&summary.id).await {
                Ok(d) => d,
                Err(err) => {
                    warn!(container_id = %summary.id, error = %err, "inspect failed during sweep");
                    continue;
                }
            };
            seen_names.push(name.clone());

            // a running container with no ping record means the daemon
            // restarted; treat it as alive as of now
            if detail.is_active() && !self.pings.contains_key(&name) {
                self.pings.insert(name.clone(), now);
            }

            let run_duration = now.signed_duration_since(detail.started_at);
            let start_is_sane = run_duration < self.cfg.sane_start_age;
            let last_ping = self.pings.get(&name).map(|p| *p);

            if start_is_sane && run_duration > max_lifetime {
                info!(%name, run_minutes = run_duration.num_minutes(), "session exceeded max lifetime");
                self.schedule(
                    Command::BackupCleanup,
                    json!(BackupCleanupArgs {
                        name: name.clone(),
                        container_id: detail.id.clone(),
                    }),
                )
                .await;
            } else if detail.is_active() {
                let idle = last_ping
                    .map(|p| now.signed_duration_since(p))
                    .unwrap_or(Duration::zero());
                if idle > inactivity_timeout {
                    info!(%name, idle_minutes = idle.num_minutes(), "session inactive");
                    self.schedule(
                        Command::BackupCleanup,
                        json!(BackupCleanupArgs {
                            name: name.clone(),
                            container_id: detail.id.clone(),
                        }),
                    )
                    .await;
                }
            } else if now.signed_duration_since(detail.finished_at) > self.cfg.delete_stopped_grace {
                debug!(%name, "stopped session past grace period");
                self.schedule(
                    Command::Delete,
                    json!(DeleteArgs {
                        name: name.clone(),
                        container_id: detail.id.clone(),
                    }),
                )
                .await;
            }

            if detail.is_active() {
                live_ids.push(detail.id.clone());
            }
            new_valid.insert(
                name,
                ValidEntry {
                    id: detail.id.clone(),
                    host_ports: detail.ports.iter().map(|b| b.host_port).collect(),
                    status: summary.status,
                    active: detail.is_active(),
                },
            );
        }

        // forget pings for names that no longer exist
        self.pings.retain(|name, _| seen_names.contains(name));

        match self.valid.write() {
            Ok(mut valid) => *valid = new_valid,
            Err(_) => warn!("valid index lock poisoned, keeping stale index"),
        }

        self.schedule(Command::RefreshSlots, json!({ "live": live_ids }))
            .await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests;
