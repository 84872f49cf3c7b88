//! fleetd - session-container worker daemon
//!
//! Runs on every node of the fleet: owns the local container registry,
//! the disk-slot pool, and the node's end of the signed command bus, and
//! drives the periodic housekeeping sweep.

use anyhow::{Context, Result};
use fleet_core::caps::{BucketStore, ClusterMetrics, ContainerRuntime, SingleNodeMetrics};
use fleet_core::cluster::{AdmissionConfig, AdmissionController, StoreLeaderElection};
use fleet_core::observability::StructuredLogger;
use fleet_core::orchestrator::{Orchestrator, OrchestratorConfig};
use fleet_core::queue::{
    watch_lanes, ChannelScheduler, Dispatcher, QueueServer, SignedCodec, TaskHandler,
    TaskScheduler,
};
use fleet_core::registry::{ContainerRegistry, LifecycleHooks, RegistryConfig, SessionHooks};
use fleet_core::slots::{SlotAllocator, SlotConfig};
use fleet_core::store::{MemoryStore, Store};
use fleet_core::{FleetMetrics, HealthBoard, Subsystem};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod bucket_fs;
mod config;
mod runtime_docker;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetd");

    // Load configuration
    let cfg = config::FleetConfig::load()?;
    info!(instance_id = %cfg.instance_id, "Daemon configured");

    // Health board: subsystems start out ok, the queue reports once its
    // listeners are bound, later passes downgrade as they observe
    // failures.
    let health = HealthBoard::new();
    health.report_ok(Subsystem::Registry);
    health.report_ok(Subsystem::Slots);
    health.report_ok(Subsystem::Admission);

    // Initialize metrics and structured logger
    FleetMetrics::new();
    let logger = StructuredLogger::new(&cfg.instance_id);
    logger.log_startup(DAEMON_VERSION);

    // Capabilities. The record store and cluster metrics here are the
    // single-node implementations; clustered deployments swap in backends
    // for the same traits.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime_docker::DockerRuntime::connect()?);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let cluster: Arc<dyn ClusterMetrics> = Arc::new(SingleNodeMetrics::new(&cfg.instance_id));
    let bucket: Arc<dyn BucketStore> = Arc::new(bucket_fs::FsBucketStore::new(&cfg.bucket_root));

    let slots = Arc::new(SlotAllocator::new(SlotConfig {
        capacity: cfg.slot_capacity,
        mount_root: cfg.mount_root.clone().into(),
        ..SlotConfig::default()
    }));

    // The maintenance sweep schedules follow-up work onto the daemon's own
    // job lane, so it flows through the same deduplicating dispatcher as
    // commands arriving off the wire.
    let (jobs_tx, jobs_rx) = mpsc::channel(64);
    let (rpcs_tx, rpcs_rx) = mpsc::channel(16);
    let scheduler: Arc<dyn TaskScheduler> = Arc::new(ChannelScheduler::new(jobs_tx.clone()));

    let hooks: Arc<dyn LifecycleHooks> = Arc::new(SessionHooks::new(
        slots.clone(),
        store.clone(),
        bucket,
        cfg.backup_bucket.clone(),
    ));

    let registry = Arc::new(ContainerRegistry::new(
        runtime.clone(),
        hooks,
        scheduler,
        slots.clone(),
        store.clone(),
        RegistryConfig {
            image: cfg.session_image.clone(),
            ..RegistryConfig::default()
        },
    ));

    let admission = Arc::new(AdmissionController::new(
        cluster.clone(),
        AdmissionConfig::default(),
    ));
    let leader = Arc::new(StoreLeaderElection::new(store.clone(), cluster.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        admission,
        leader,
        cluster,
        runtime,
        slots,
        health.clone(),
        OrchestratorConfig {
            max_lifetime: chrono::Duration::seconds(cfg.max_lifetime_secs),
            inactivity_timeout: chrono::Duration::seconds(cfg.inactivity_timeout_secs),
            housekeeping_interval: std::time::Duration::from_secs(cfg.housekeeping_interval_secs),
            max_sessions: cfg.max_sessions,
        },
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        orchestrator.clone() as Arc<dyn TaskHandler>
    ));

    // Bind both queue lanes up front so a port clash fails startup.
    let job_listener = TcpListener::bind(("0.0.0.0", cfg.job_port))
        .await
        .with_context(|| format!("could not bind job lane on port {}", cfg.job_port))?;
    let rpc_listener = TcpListener::bind(("0.0.0.0", cfg.rpc_port))
        .await
        .with_context(|| format!("could not bind rpc lane on port {}", cfg.rpc_port))?;
    health.report_ok(Subsystem::Queue);

    let codec = Arc::new(SignedCodec::new(cfg.secret_key.as_bytes().to_vec()));
    let (shutdown_tx, _) = broadcast::channel(1);

    let job_server = Arc::new(QueueServer::new(codec.clone()));
    let rpc_server = job_server.clone();
    let job_shutdown = shutdown_tx.subscribe();
    let rpc_shutdown = shutdown_tx.subscribe();
    let job_lane = tokio::spawn(async move {
        job_server
            .serve_jobs(job_listener, jobs_tx, job_shutdown)
            .await;
    });
    let rpc_lane = tokio::spawn(async move {
        rpc_server
            .serve_rpc(rpc_listener, rpcs_tx, rpc_shutdown)
            .await;
    });
    tokio::spawn(watch_lanes(
        job_lane,
        rpc_lane,
        health.clone(),
        shutdown_tx.subscribe(),
    ));

    // Shared state for the health/session/metrics API
    let app_state = Arc::new(api::AppState {
        health: health.clone(),
        registry: registry.clone(),
    });
    tokio::spawn(api::serve(cfg.api_port, app_state));

    // Main daemon loop
    let loop_shutdown = shutdown_tx.subscribe();
    let loop_orchestrator = orchestrator.clone();
    let loop_dispatcher = dispatcher.clone();
    let daemon = tokio::spawn(async move {
        loop_orchestrator
            .run(loop_dispatcher, jobs_rx, rpcs_rx, loop_shutdown)
            .await;
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());
    let _ = daemon.await;
    info!("Shut down");

    Ok(())
}
