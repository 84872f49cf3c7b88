//! Node health board
//!
//! Subsystems report their condition as a side effect of doing real
//! work: the sweep reports for the registry, the load publisher for the
//! admission metrics, the lane watchdog for the queue. The HTTP
//! endpoints only read the aggregate. Liveness tolerates a degraded node;
//! readiness additionally requires that startup finished and no
//! subsystem has failed.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Condition of one subsystem. The worst reported condition wins in the
/// node aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Ok,
    Degraded,
    Failed,
}

/// The daemon subsystems that report to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    /// Container registry and the maintenance sweep.
    Registry,
    /// Both command-bus listeners.
    Queue,
    /// The disk slot pool.
    Slots,
    /// Cluster metrics backing admission decisions.
    Admission,
}

/// Latest report for one subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct SubsystemReport {
    pub condition: Condition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Epoch seconds at which the subsystem entered this condition.
    /// Re-reporting the same condition does not reset it, so operators
    /// can read how long a subsystem has been degraded.
    pub since: i64,
}

/// Aggregate view served by the liveness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub condition: Condition,
    pub subsystems: BTreeMap<Subsystem, SubsystemReport>,
}

/// Answer for the readiness endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Default)]
struct BoardState {
    subsystems: BTreeMap<Subsystem, SubsystemReport>,
    serving: bool,
}

/// Shared health board; clones observe the same state.
///
/// All methods are synchronous: reports happen on hot paths that must
/// not await an HTTP handler, and the guarded work is a map update.
#[derive(Clone, Default)]
pub struct HealthBoard {
    state: Arc<RwLock<BoardState>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn report(&self, subsystem: Subsystem, condition: Condition, detail: Option<String>) {
        let mut state = self.state.write().expect("health board lock poisoned");
        match state.subsystems.get_mut(&subsystem) {
            Some(report) if report.condition == condition => {
                report.detail = detail;
            }
            _ => {
                state.subsystems.insert(
                    subsystem,
                    SubsystemReport {
                        condition,
                        detail,
                        since: chrono::Utc::now().timestamp(),
                    },
                );
            }
        }
    }

    pub fn report_ok(&self, subsystem: Subsystem) {
        self.report(subsystem, Condition::Ok, None);
    }

    pub fn report_degraded(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.report(subsystem, Condition::Degraded, Some(detail.into()));
    }

    pub fn report_failed(&self, subsystem: Subsystem, detail: impl Into<String>) {
        self.report(subsystem, Condition::Failed, Some(detail.into()));
    }

    /// Flipped on once startup wiring is complete, and off again when
    /// shutdown begins so load balancers drain the node first.
    pub fn set_serving(&self, serving: bool) {
        let mut state = self.state.write().expect("health board lock poisoned");
        state.serving = serving;
    }

    pub fn snapshot(&self) -> NodeHealth {
        let state = self.state.read().expect("health board lock poisoned");
        let condition = state
            .subsystems
            .values()
            .map(|r| r.condition)
            .max()
            .unwrap_or(Condition::Ok);
        NodeHealth {
            condition,
            subsystems: state.subsystems.clone(),
        }
    }

    pub fn readiness(&self) -> Readiness {
        let state = self.state.read().expect("health board lock poisoned");
        if !state.serving {
            return Readiness {
                ready: false,
                reason: Some("daemon still starting".to_string()),
            };
        }
        for (subsystem, report) in &state.subsystems {
            if report.condition == Condition::Failed {
                return Readiness {
                    ready: false,
                    reason: Some(format!("{subsystem:?} subsystem failed").to_lowercase()),
                };
            }
        }
        Readiness {
            ready: true,
            reason: None,
        }
    }
}
