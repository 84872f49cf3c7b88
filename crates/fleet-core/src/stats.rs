//! Host resource sampling and the node load figure
//!
//! The single published "Load" percentage is the worst of the node's
//! resource pressures: CPU, memory, storage slots, and session count.
//! Whichever dimension saturates first is the one that stops this node
//! accepting new sessions.

use std::sync::Mutex;
use sysinfo::System;

/// One point-in-time host sample, percentages in [0, 100].
#[derive(Debug, Clone, Copy)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

/// Samples host CPU and memory through the OS. CPU usage is computed
/// between consecutive samples, so the first call after startup reads
/// near zero; the periodic housekeeping cadence makes later samples
/// meaningful.
pub struct HostSampler {
    sys: Mutex<System>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    pub fn sample(&self) -> HostSample {
        let mut sys = self.sys.lock().expect("sysinfo mutex poisoned");
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_usage() as f64;
        let total = sys.total_memory();
        let mem_percent = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 * 100.0 / total as f64
        };
        HostSample {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            mem_percent: mem_percent.clamp(0.0, 100.0),
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Active sessions as a percentage of the configured maximum.
pub fn sessions_percent(active: usize, max_sessions: usize) -> f64 {
    if max_sessions == 0 {
        return 0.0;
    }
    (active as f64 * 100.0 / max_sessions as f64).clamp(0.0, 100.0)
}

/// The published load figure: the maximum of the individual pressures.
pub fn load_figure(host: HostSample, slots_used_percent: f64, sessions_pct: f64) -> f64 {
    host.cpu_percent
        .max(host.mem_percent)
        .max(slots_used_percent)
        .max(sessions_pct)
        .clamp(0.0, 100.0)
}
