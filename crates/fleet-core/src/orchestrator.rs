//! Worker daemon loop
//!
//! Composes the core: consumes queue commands through the deduplicating
//! dispatcher, answers RPC status queries, and runs the periodic
//! housekeeping tick (maintenance sweep, load publication, leader
//! proposal, scale-down check). Anything that can block on a container
//! runs in a dispatched worker task, never in the loop itself.

use crate::caps::{async_trait, ClusterMetrics, ContainerRuntime, LeaderElection};
use crate::cluster::{AdmissionController, STAT_LOAD};
use crate::health::{HealthBoard, Subsystem};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::queue::{
    BackupCleanupArgs, Command, DeleteArgs, Dispatcher, LaunchSessionArgs, QueueMessage,
    RpcRequest, TaskHandler,
};
use crate::registry::ContainerRegistry;
use crate::slots::SlotAllocator;
use crate::stats::{load_figure, sessions_percent, HostSampler};
use anyhow::{bail, Result};
use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Sessions older than this are backed up and deleted.
    pub max_lifetime: Duration,
    /// Sessions without a liveness ping for this long are backed up and
    /// deleted.
    pub inactivity_timeout: Duration,
    /// Cadence of the housekeeping tick.
    pub housekeeping_interval: std::time::Duration,
    /// Session count at which this node reports 100% session pressure.
    pub max_sessions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::hours(8),
            inactivity_timeout: Duration::minutes(60),
            housekeeping_interval: std::time::Duration::from_secs(300),
            max_sessions: 32,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ContainerRegistry>,
    admission: Arc<AdmissionController>,
    leader: Arc<dyn LeaderElection>,
    metrics: Arc<dyn ClusterMetrics>,
    runtime: Arc<dyn ContainerRuntime>,
    slots: Arc<SlotAllocator>,
    sampler: HostSampler,
    fleet_metrics: FleetMetrics,
    logger: StructuredLogger,
    health: HealthBoard,
    cfg: OrchestratorConfig,
}

#[derive(Deserialize)]
struct RefreshSlotsArgs {
    live: Vec<String>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ContainerRegistry>,
        admission: Arc<AdmissionController>,
        leader: Arc<dyn LeaderElection>,
        metrics: Arc<dyn ClusterMetrics>,
        runtime: Arc<dyn ContainerRuntime>,
        slots: Arc<SlotAllocator>,
        health: HealthBoard,
        cfg: OrchestratorConfig,
    ) -> Self {
        let instance_id = metrics.instance_id();
        Self {
            registry,
            admission,
            leader,
            metrics,
            runtime,
            slots,
            sampler: HostSampler::new(),
            fleet_metrics: FleetMetrics::new(),
            logger: StructuredLogger::new(instance_id),
            health,
            cfg,
        }
    }

    /// Compute and publish this node's load figure; returns it.
    pub async fn publish_load(&self) -> f64 {
        let host = self.sampler.sample();
        let slots_used = self.slots.used_percent();
        let active = self.registry.active_sessions();
        let load = load_figure(host, slots_used, sessions_percent(active, self.cfg.max_sessions));

        self.admission.note_self_load(load);
        self.fleet_metrics.set_node_load(load);
        self.fleet_metrics.set_slots_used(slots_used);
        self.fleet_metrics.set_sessions_active(active as i64);

        if let Err(err) = self.metrics.publish_stat(STAT_LOAD, "Percent", load).await {
            warn!(error = %err, "could not publish load stat");
        }
        load
    }

    async fn housekeeping(&self) {
        match self
            .registry
            .maintain(self.cfg.max_lifetime, self.cfg.inactivity_timeout)
            .await
        {
            Ok(()) => self.health.report_ok(Subsystem::Registry),
            Err(err) => {
                warn!(error = %err, "maintenance sweep failed");
                self.health.report_failed(Subsystem::Registry, err.to_string());
            }
        }

        let load = self.publish_load().await;
        if self.slots.used_percent() >= 90.0 {
            self.health
                .report_degraded(Subsystem::Slots, "pool nearly exhausted");
        } else {
            self.health.report_ok(Subsystem::Slots);
        }

        // admission falls back to single-node decisions while the
        // cluster metrics backend is unreachable
        match self.metrics.cluster_load(STAT_LOAD).await {
            Ok(_) => self.health.report_ok(Subsystem::Admission),
            Err(err) => self.health.report_degraded(
                Subsystem::Admission,
                format!("cluster metrics unreachable: {err}"),
            ),
        }

        let is_leader = self.leader.is_leader().await;
        if self.registry.active_sessions() == 0 && self.admission.can_terminate(is_leader).await {
            self.logger.log_self_termination();
            if let Err(err) = self.metrics.terminate_self().await {
                warn!(error = %err, "self termination failed");
            }
        }
        debug!(load, is_leader, "housekeeping pass complete");
    }

    /// Answer one RPC request. Failures to reply mean the caller has
    /// already timed out and gone away.
    pub async fn answer(&self, req: RpcRequest) {
        let answer = match req.cmd {
            Command::SessionStatus => json!(self.registry.session_status()),
            Command::TerminationCheck => {
                let is_leader = self.leader.is_leader().await;
                json!({ "can_terminate": self.admission.can_terminate(is_leader).await })
            }
            other => {
                warn!(cmd = ?other, "command is not a query");
                json!({ "error": "unsupported" })
            }
        };
        if req.reply.send(answer).is_err() {
            debug!(cmd = ?req.cmd, "rpc caller went away before the reply");
        }
    }

    /// Main daemon loop; returns on shutdown.
    pub async fn run(
        &self,
        dispatcher: Arc<Dispatcher>,
        mut jobs: mpsc::Receiver<QueueMessage>,
        mut rpcs: mpsc::Receiver<RpcRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = self.cfg.housekeeping_interval.as_secs(),
            "daemon loop running"
        );
        self.health.set_serving(true);

        let mut tick = tokio::time::interval(self.cfg.housekeeping_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = jobs.recv() => {
                    match dispatcher.submit(msg.cmd, msg.data) {
                        Ok(true) => {}
                        Ok(false) => self.fleet_metrics.inc_tasks_deduplicated(),
                        Err(err) => warn!(error = %err, "could not dispatch queue message"),
                    }
                    self.fleet_metrics.set_tasks_in_flight(dispatcher.in_flight_count() as i64);
                }
                Some(req) = rpcs.recv() => self.answer(req).await,
                _ = tick.tick() => {
                    self.fleet_metrics.set_tasks_in_flight(dispatcher.in_flight_count() as i64);
                    self.housekeeping().await;
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("signal");
                    self.health.set_serving(false);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TaskHandler for Orchestrator {
    async fn handle(&self, cmd: Command, data: Value) -> Result<()> {
        match cmd {
            Command::BackupCleanup => {
                let args: BackupCleanupArgs = serde_json::from_value(data)?;
                self.registry.delete(&args.container_id, true).await?;
                self.fleet_metrics.inc_sessions_cleaned();
                self.logger.log_session_cleaned(&args.name, true, "sweep");
                Ok(())
            }
            Command::Delete => {
                let args: DeleteArgs = serde_json::from_value(data)?;
                self.registry.delete(&args.container_id, false).await?;
                self.logger.log_session_cleaned(&args.name, false, "stopped");
                Ok(())
            }
            Command::LaunchSession => {
                let args: LaunchSessionArgs = serde_json::from_value(data)?;
                let detail = self
                    .registry
                    .launch(&args.name, &args.owner, args.reuse)
                    .await?;
                self.fleet_metrics.inc_sessions_launched();
                self.logger
                    .log_session_launched(&args.name, &detail.id, args.reuse);
                Ok(())
            }
            Command::RefreshSlots => {
                let args: RefreshSlotsArgs = serde_json::from_value(data)?;
                self.slots.refresh(self.runtime.as_ref(), &args.live).await;
                Ok(())
            }
            Command::CollectStats => {
                self.publish_load().await;
                Ok(())
            }
            Command::SessionStatus | Command::TerminationCheck => {
                bail!("query command {cmd:?} received on the job lane")
            }
        }
    }
}
