//! Orchestration core for a fleet of session-container hosts
//!
//! This crate provides the core functionality for:
//! - Container/session lifecycle management and the maintenance sweep
//! - Admission control and scale-up/scale-down decisions
//! - The signed asynchronous command bus between the request-serving
//!   process and the worker daemon
//! - The bounded storage-slot allocator shared by session containers
//! - Health checks and observability

pub mod caps;
pub mod cluster;
pub mod health;
pub mod models;
pub mod naming;
pub mod observability;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod slots;
pub mod stats;
pub mod store;

pub use health::{Condition, HealthBoard, NodeHealth, Readiness, Subsystem};
pub use models::*;
pub use observability::FleetMetrics;
