use super::*;
use crate::caps::async_trait;
use crate::models::{ContainerSummary, ImageInfo, PortBinding};
use crate::queue::Dispatcher;
use crate::slots::SlotConfig;
use crate::store::MemoryStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct MockContainer {
    name: String,
    spec: ContainerSpec,
    running: bool,
    created: DateTime<Utc>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    host_ports: Vec<PortBinding>,
}

#[derive(Default)]
pub(crate) struct MockRuntime {
    seq: AtomicUsize,
    containers: Mutex<HashMap<String, MockContainer>>,
}

impl MockRuntime {
    pub(crate) fn count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub(crate) fn set_started(&self, id: &str, at: DateTime<Utc>) {
        self.containers
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .started_at = at;
    }

    pub(crate) fn set_finished(&self, id: &str, at: DateTime<Utc>) {
        self.containers
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .finished_at = at;
    }

    pub(crate) fn set_running(&self, id: &str, running: bool) {
        self.containers
            .lock()
            .unwrap()
            .get_mut(id)
            .unwrap()
            .running = running;
    }

    pub(crate) fn host_ports(&self, id: &str) -> Vec<u16> {
        self.containers.lock().unwrap()[id]
            .host_ports
            .iter()
            .map(|b| b.host_port)
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("c{n}");
        let host_ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| PortBinding {
                container_port: *p,
                host_port: 32000 + (n as u16) * 10 + i as u16,
            })
            .collect();
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                name: format!("/{}", spec.name),
                spec: spec.clone(),
                running: false,
                created: Utc::now(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                host_ports,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))?;
        c.running = true;
        c.started_at = Utc::now();
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout_secs: u32) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))?;
        c.running = false;
        c.finished_at = Utc::now();
        Ok(())
    }

    async fn restart(&self, id: &str, _timeout_secs: u32) -> Result<()> {
        self.start(id).await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.stop(id, 0).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail> {
        let containers = self.containers.lock().unwrap();
        let c = containers
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("no such container {id}"))?;
        Ok(ContainerDetail {
            id: id.to_string(),
            name: c.name.clone(),
            image: c.spec.image.clone(),
            created: c.created,
            started_at: c.started_at,
            finished_at: c.finished_at,
            running: c.running,
            restarting: false,
            ports: c.host_ports.clone(),
            mounts: c
                .spec
                .binds
                .iter()
                .map(|b| crate::models::MountPoint {
                    source: b.host_path.clone(),
                    destination: b.container_path.clone(),
                })
                .collect(),
            cpu_shares: c.spec.cpu_shares,
            memory_bytes: c.spec.memory_bytes,
        })
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| all || c.running)
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: Some(c.name.clone()),
                status: if c.running {
                    "Up 5 minutes".to_string()
                } else {
                    "Exited (0) 5 minutes ago".to_string()
                },
                image: c.spec.image.clone(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        Ok(vec![])
    }
}

#[derive(Default)]
pub(crate) struct RecordingScheduler {
    scheduled: Mutex<Vec<(Command, serde_json::Value)>>,
}

impl RecordingScheduler {
    pub(crate) fn of(&self, cmd: Command) -> Vec<serde_json::Value> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == cmd)
            .map(|(_, d)| d.clone())
            .collect()
    }
}

#[async_trait]
impl TaskScheduler for RecordingScheduler {
    async fn schedule(&self, cmd: Command, data: serde_json::Value) -> Result<()> {
        self.scheduled.lock().unwrap().push((cmd, data));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LifecycleHooks for RecordingHooks {
    async fn before_create(&self, name: &str, _slot: u32) -> Result<()> {
        self.events.lock().unwrap().push(format!("prepare:{name}"));
        Ok(())
    }

    async fn on_start(&self, detail: &ContainerDetail) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("start:{}", naming::normalize(&detail.name)));
        Ok(())
    }

    async fn on_stop(&self, detail: &ContainerDetail) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("stop:{}", naming::normalize(&detail.name)));
        Ok(())
    }

    async fn on_restart(&self, detail: &ContainerDetail) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("restart:{}", naming::normalize(&detail.name)));
        Ok(())
    }

    async fn on_kill(&self, detail: &ContainerDetail) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("kill:{}", naming::normalize(&detail.name)));
        Ok(())
    }

    async fn before_delete(&self, detail: &ContainerDetail, backup: bool) -> Result<()> {
        self.events.lock().unwrap().push(format!(
            "delete:{}:backup={backup}",
            naming::normalize(&detail.name)
        ));
        Ok(())
    }
}

struct Harness {
    runtime: Arc<MockRuntime>,
    scheduler: Arc<RecordingScheduler>,
    hooks: Arc<RecordingHooks>,
    slots: Arc<SlotAllocator>,
    store: Arc<MemoryStore>,
    registry: ContainerRegistry,
}

fn harness(slot_capacity: usize) -> Harness {
    let runtime = Arc::new(MockRuntime::default());
    let scheduler = Arc::new(RecordingScheduler::default());
    let hooks = Arc::new(RecordingHooks::default());
    let slots = Arc::new(SlotAllocator::new(SlotConfig {
        capacity: slot_capacity,
        lease: std::time::Duration::from_secs(120),
        mount_root: PathBuf::from("/mnt/fleet"),
    }));
    let store = Arc::new(MemoryStore::new());
    let registry = ContainerRegistry::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&hooks) as Arc<dyn LifecycleHooks>,
        Arc::clone(&scheduler) as Arc<dyn TaskScheduler>,
        Arc::clone(&slots),
        Arc::clone(&store) as Arc<dyn Store>,
        RegistryConfig::default(),
    );
    Harness {
        runtime,
        scheduler,
        hooks,
        slots,
        store,
        registry,
    }
}

#[tokio::test]
async fn test_launch_creates_starts_and_pings() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();

    assert!(detail.running);
    assert_eq!(h.runtime.count(), 1);
    assert_eq!(h.slots.used_percent(), 25.0);
    assert!(h.registry.pings.contains_key("_abc_0"));
    assert_eq!(h.hooks.events(), vec!["prepare:_abc_0", "start:_abc_0"]);

    let props = SessionProps::load(h.store.as_ref(), "_abc_0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(props.owner, "user@example.org");
}

#[tokio::test]
async fn test_launch_reuses_running_container() {
    let h = harness(4);
    let first = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    let second = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.runtime.count(), 1);
    // only one slot was ever taken
    assert_eq!(h.slots.used_percent(), 25.0);
}

#[tokio::test]
async fn test_launch_without_reuse_recreates() {
    let h = harness(2);
    let first = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    let second = h.registry.launch("_abc_0", "user@example.org", false).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(h.runtime.count(), 1);
    assert!(h
        .hooks
        .events()
        .contains(&"delete:_abc_0:backup=false".to_string()));
}

#[tokio::test]
async fn test_launch_fails_without_free_slot() {
    let h = harness(0);
    let result = h.registry.launch("_abc_0", "user@example.org", true).await;
    assert!(result.is_err());
    assert_eq!(h.runtime.count(), 0);
}

#[tokio::test]
async fn test_delete_runs_hook_and_forgets_ping() {
    let h = harness(2);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();

    h.registry.delete(&detail.id, true).await.unwrap();
    assert_eq!(h.runtime.count(), 0);
    assert!(!h.registry.pings.contains_key("_abc_0"));
    assert!(h
        .hooks
        .events()
        .contains(&"delete:_abc_0:backup=true".to_string()));
}

#[tokio::test]
async fn test_stop_restart_kill_run_their_hooks() {
    let h = harness(2);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();

    h.registry.stop(&detail.id).await.unwrap();
    assert!(!h.runtime.inspect(&detail.id).await.unwrap().running);

    h.registry.restart(&detail.id).await.unwrap();
    assert!(h.runtime.inspect(&detail.id).await.unwrap().running);

    h.registry.kill(&detail.id).await.unwrap();
    assert!(!h.runtime.inspect(&detail.id).await.unwrap().running);

    let events = h.hooks.events();
    assert!(events.contains(&"stop:_abc_0".to_string()));
    assert!(events.contains(&"restart:_abc_0".to_string()));
    assert!(events.contains(&"kill:_abc_0".to_string()));
}

#[tokio::test]
async fn test_sweep_flags_over_lifetime_session() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    h.runtime
        .set_started(&detail.id, Utc::now() - Duration::hours(3));

    h.registry
        .maintain(Duration::hours(2), Duration::minutes(60))
        .await
        .unwrap();

    let cleanups = h.scheduler.of(Command::BackupCleanup);
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0]["container_id"], detail.id);
    assert_eq!(cleanups[0]["name"], "_abc_0");

    // the sweep itself must not have touched the container
    assert_eq!(h.runtime.count(), 1);
}

#[tokio::test]
async fn test_sweep_flags_inactive_session() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    h.registry
        .pings
        .insert("_abc_0".to_string(), Utc::now() - Duration::hours(2));

    h.registry
        .maintain(Duration::hours(8), Duration::minutes(60))
        .await
        .unwrap();

    let cleanups = h.scheduler.of(Command::BackupCleanup);
    assert_eq!(cleanups.len(), 1);
    assert_eq!(cleanups[0]["container_id"], detail.id);
}

#[tokio::test]
async fn test_sweep_deletes_stopped_session_after_grace() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    h.runtime.set_running(&detail.id, false);
    h.runtime
        .set_finished(&detail.id, Utc::now() - Duration::minutes(30));

    h.registry
        .maintain(Duration::hours(8), Duration::minutes(60))
        .await
        .unwrap();

    assert!(h.scheduler.of(Command::BackupCleanup).is_empty());
    let deletes = h.scheduler.of(Command::Delete);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0]["container_id"], detail.id);
}

#[tokio::test]
async fn test_sweep_leaves_healthy_session_alone() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();

    h.registry
        .maintain(Duration::hours(8), Duration::minutes(60))
        .await
        .unwrap();

    assert!(h.scheduler.of(Command::BackupCleanup).is_empty());
    assert!(h.scheduler.of(Command::Delete).is_empty());

    // slot refresh carries the live container id
    let refreshes = h.scheduler.of(Command::RefreshSlots);
    assert_eq!(refreshes.len(), 1);
    assert_eq!(refreshes[0]["live"], serde_json::json!([detail.id]));
}

#[tokio::test]
async fn test_sweep_synthesizes_missing_ping() {
    let h = harness(4);
    h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    // daemon restart: ping records are gone, container still runs
    h.registry.pings.clear();

    h.registry
        .maintain(Duration::hours(8), Duration::minutes(60))
        .await
        .unwrap();

    assert!(h.registry.pings.contains_key("_abc_0"));
    assert!(h.scheduler.of(Command::BackupCleanup).is_empty());
}

#[tokio::test]
async fn test_sweep_drops_stale_pings_and_rebuilds_index() {
    let h = harness(4);
    let detail = h.registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    h.registry.pings.insert("_gone_0".to_string(), Utc::now());

    h.registry
        .maintain(Duration::hours(8), Duration::minutes(60))
        .await
        .unwrap();

    assert!(!h.registry.pings.contains_key("_gone_0"));

    let ports = h.runtime.host_ports(&detail.id);
    assert!(h.registry.is_valid_container("_abc_0", &ports));
    assert!(!h.registry.is_valid_container("_abc_0", &[9999]));
    assert!(!h.registry.is_valid_container("_gone_0", &ports));

    let status = h.registry.session_status();
    assert_eq!(status.get("_abc_0").map(String::as_str), Some("Up 5 minutes"));
    assert_eq!(h.registry.active_sessions(), 1);
}

#[tokio::test]
async fn test_sweep_ignores_non_session_roles() {
    let h = harness(4);
    let api_name = naming::derived_name(ContainerRole::ApiWorker, "user@example.org", 0);
    h.registry.launch(&api_name, "user@example.org", true).await.unwrap();
    h.runtime
        .set_started("c0", Utc::now() - Duration::hours(30));

    h.registry
        .maintain(Duration::hours(2), Duration::minutes(60))
        .await
        .unwrap();

    assert!(h.scheduler.of(Command::BackupCleanup).is_empty());
    assert_eq!(h.registry.active_sessions(), 0);
}

/// Task handler that records invocations per command and blocks until
/// the test releases it, standing in for a slow backup.
struct GatedCleanupHandler {
    counts: Mutex<HashMap<Command, usize>>,
    release: tokio::sync::Notify,
}

#[async_trait]
impl crate::queue::TaskHandler for GatedCleanupHandler {
    async fn handle(&self, cmd: Command, _data: serde_json::Value) -> Result<()> {
        *self.counts.lock().unwrap().entry(cmd).or_insert(0) += 1;
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_overlapping_sweeps_schedule_cleanup_once() {
    let handler = Arc::new(GatedCleanupHandler {
        counts: Mutex::new(HashMap::new()),
        release: tokio::sync::Notify::new(),
    });
    let dispatcher = Arc::new(Dispatcher::new(handler.clone()));

    let runtime = Arc::new(MockRuntime::default());
    let slots = Arc::new(SlotAllocator::new(SlotConfig {
        capacity: 4,
        lease: std::time::Duration::from_secs(120),
        mount_root: PathBuf::from("/mnt/fleet"),
    }));
    let registry = ContainerRegistry::new(
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::new(RecordingHooks::default()),
        Arc::clone(&dispatcher) as Arc<dyn TaskScheduler>,
        slots,
        Arc::new(MemoryStore::new()),
        RegistryConfig::default(),
    );

    let detail = registry.launch("_abc_0", "user@example.org", true).await.unwrap();
    runtime.set_started(&detail.id, Utc::now() - Duration::hours(3));

    registry
        .maintain(Duration::hours(2), Duration::minutes(60))
        .await
        .unwrap();
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    // cleanup still in flight when the next sweep fires
    registry
        .maintain(Duration::hours(2), Duration::minutes(60))
        .await
        .unwrap();
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        handler
            .counts
            .lock()
            .unwrap()
            .get(&Command::BackupCleanup)
            .copied(),
        Some(1)
    );
    handler.release.notify_waiters();
}
