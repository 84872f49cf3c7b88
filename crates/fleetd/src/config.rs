//! Daemon configuration

use anyhow::Result;
use serde::Deserialize;

/// Daemon configuration, loaded from FLEETD_* environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Instance id of this node within the scaling group
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Listener port for the fire-and-forget command lane
    #[serde(default = "default_job_port")]
    pub job_port: u16,

    /// Listener port for the synchronous RPC lane
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Shared secret for signing queue messages
    #[serde(default = "default_secret_key")]
    pub secret_key: String,

    /// Image for new session containers
    #[serde(default = "default_session_image")]
    pub session_image: String,

    /// Number of disk slots in the pool
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: usize,

    /// Filesystem root under which slot devices are mounted
    #[serde(default = "default_mount_root")]
    pub mount_root: String,

    /// Session count at which the node reports 100% session pressure
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions older than this are backed up and deleted, in seconds
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: i64,

    /// Sessions without a liveness ping for this long are backed up and
    /// deleted, in seconds
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: i64,

    /// Cadence of the housekeeping tick in seconds
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,

    /// Bucket that receives home-directory snapshots
    #[serde(default = "default_backup_bucket")]
    pub backup_bucket: String,

    /// Local directory backing the bucket store
    #[serde(default = "default_bucket_root")]
    pub bucket_root: String,
}

fn default_instance_id() -> String {
    std::env::var("INSTANCE_ID").unwrap_or_else(|_| "localhost".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_job_port() -> u16 {
    5700
}

fn default_rpc_port() -> u16 {
    5701
}

fn default_secret_key() -> String {
    "insecure-dev-secret".to_string()
}

fn default_session_image() -> String {
    "session:latest".to_string()
}

fn default_slot_capacity() -> usize {
    32
}

fn default_mount_root() -> String {
    "/mnt/fleet".to_string()
}

fn default_max_sessions() -> usize {
    32
}

fn default_max_lifetime() -> i64 {
    8 * 3600
}

fn default_inactivity_timeout() -> i64 {
    3600
}

fn default_housekeeping_interval() -> u64 {
    300
}

fn default_backup_bucket() -> String {
    "fleet-backups".to_string()
}

fn default_bucket_root() -> String {
    "/var/lib/fleetd/buckets".to_string()
}

impl FleetConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("FLEETD"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| FleetConfig {
            instance_id: default_instance_id(),
            api_port: default_api_port(),
            job_port: default_job_port(),
            rpc_port: default_rpc_port(),
            secret_key: default_secret_key(),
            session_image: default_session_image(),
            slot_capacity: default_slot_capacity(),
            mount_root: default_mount_root(),
            max_sessions: default_max_sessions(),
            max_lifetime_secs: default_max_lifetime(),
            inactivity_timeout_secs: default_inactivity_timeout(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            backup_bucket: default_backup_bucket(),
            bucket_root: default_bucket_root(),
        }))
    }
}
