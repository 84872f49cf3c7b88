//! Observability infrastructure for the worker daemon
//!
//! Prometheus metrics for the orchestration core (node load, session and
//! slot occupancy, task throughput) plus a structured event logger.

use prometheus::{register_gauge, register_int_counter, register_int_gauge, Gauge, IntCounter, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct FleetMetricsInner {
    node_load_percent: Gauge,
    slots_used_percent: Gauge,
    sessions_active: IntGauge,
    tasks_in_flight: IntGauge,
    sessions_launched: IntCounter,
    sessions_cleaned: IntCounter,
    tasks_deduplicated: IntCounter,
    queue_rejections: IntCounter,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            node_load_percent: register_gauge!(
                "fleetd_node_load_percent",
                "Published load figure for this node, worst resource pressure in percent"
            )
            .expect("Failed to register node_load_percent"),

            slots_used_percent: register_gauge!(
                "fleetd_slots_used_percent",
                "Disk slots occupied or under an unexpired lease, in percent"
            )
            .expect("Failed to register slots_used_percent"),

            sessions_active: register_int_gauge!(
                "fleetd_sessions_active",
                "Session containers active as of the last maintenance sweep"
            )
            .expect("Failed to register sessions_active"),

            tasks_in_flight: register_int_gauge!(
                "fleetd_tasks_in_flight",
                "Distinct queue tasks currently executing"
            )
            .expect("Failed to register tasks_in_flight"),

            sessions_launched: register_int_counter!(
                "fleetd_sessions_launched_total",
                "Total session containers launched"
            )
            .expect("Failed to register sessions_launched"),

            sessions_cleaned: register_int_counter!(
                "fleetd_sessions_cleaned_total",
                "Total session containers backed up and deleted"
            )
            .expect("Failed to register sessions_cleaned"),

            tasks_deduplicated: register_int_counter!(
                "fleetd_tasks_deduplicated_total",
                "Queue submissions dropped because an identical task was in flight"
            )
            .expect("Failed to register tasks_deduplicated"),

            queue_rejections: register_int_counter!(
                "fleetd_queue_rejections_total",
                "Queue messages dropped for signature or protocol violations"
            )
            .expect("Failed to register queue_rejections"),
        }
    }
}

/// Fleet metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    // This is just a marker - we use the global instance
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn set_node_load(&self, percent: f64) {
        self.inner().node_load_percent.set(percent);
    }

    pub fn set_slots_used(&self, percent: f64) {
        self.inner().slots_used_percent.set(percent);
    }

    pub fn set_sessions_active(&self, count: i64) {
        self.inner().sessions_active.set(count);
    }

    pub fn set_tasks_in_flight(&self, count: i64) {
        self.inner().tasks_in_flight.set(count);
    }

    pub fn inc_sessions_launched(&self) {
        self.inner().sessions_launched.inc();
    }

    pub fn inc_sessions_cleaned(&self) {
        self.inner().sessions_cleaned.inc();
    }

    pub fn inc_tasks_deduplicated(&self) {
        self.inner().tasks_deduplicated.inc();
    }

    pub fn inc_queue_rejections(&self) {
        self.inner().queue_rejections.inc();
    }
}

/// Structured logger for fleet events
///
/// Consistent JSON-formatted logging for the decisions operators page
/// on: admission, scaling, and session turnover.
#[derive(Clone)]
pub struct StructuredLogger {
    instance_id: String,
}

impl StructuredLogger {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
        }
    }

    /// Log an admission decision for a new session request
    pub fn log_admission(&self, accepted: bool, self_load: f64) {
        info!(
            event = "session_admission",
            instance = %self.instance_id,
            accepted = accepted,
            self_load = self_load,
            "Session admission decided"
        );
    }

    /// Log the peer a rejected session is pointed at
    pub fn log_redirect(&self, target: &str) {
        info!(
            event = "session_redirected",
            instance = %self.instance_id,
            target = %target,
            "Session redirected to peer"
        );
    }

    /// Log a session launch
    pub fn log_session_launched(&self, name: &str, container_id: &str, reused: bool) {
        info!(
            event = "session_launched",
            instance = %self.instance_id,
            session = %name,
            container_id = %container_id,
            reused = reused,
            "Session container launched"
        );
    }

    /// Log a session cleanup
    pub fn log_session_cleaned(&self, name: &str, backed_up: bool, reason: &str) {
        info!(
            event = "session_cleaned",
            instance = %self.instance_id,
            session = %name,
            backed_up = backed_up,
            reason = %reason,
            "Session container cleaned up"
        );
    }

    /// Log a scale-up request
    pub fn log_scale_up(&self, avg_load: f64) {
        warn!(
            event = "scale_up_requested",
            instance = %self.instance_id,
            avg_load = avg_load,
            "Requested one additional instance"
        );
    }

    /// Log self-termination
    pub fn log_self_termination(&self) {
        warn!(
            event = "self_termination",
            instance = %self.instance_id,
            "Node removing itself from the fleet"
        );
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "daemon_started",
            instance = %self.instance_id,
            version = %version,
            "Worker daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            instance = %self.instance_id,
            reason = %reason,
            "Worker daemon shutting down"
        );
    }
}
