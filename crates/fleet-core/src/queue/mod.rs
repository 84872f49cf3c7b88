//! Asynchronous command bus
//!
//! Decouples the request-serving process from the worker daemon that
//! performs container operations. Two lanes: fire-and-forget commands
//! (producer to daemon, one-directional) and synchronous RPC (any node to
//! any node, bounded timeouts) for live status queries against a specific
//! peer. Every wire message is HMAC-signed with the cluster's shared
//! secret; a signature mismatch is fatal for that message only.

mod codec;
mod dispatch;
mod message;
mod transport;

pub use codec::{task_signature, SignedCodec};
pub use dispatch::{Dispatcher, TaskHandler};
pub use message::{
    BackupCleanupArgs, Command, DeleteArgs, Envelope, LaunchSessionArgs, QueueMessage,
    RpcRequest,
};
pub use transport::{watch_lanes, JobSender, QueueServer, SenderConfig};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("signature mismatch on queue message")]
    BadSignature,
    #[error("unknown command code {0}")]
    UnknownCommand(i32),
    #[error("oversize frame of {0} bytes")]
    Oversize(usize),
}

/// Seam through which components enqueue asynchronous work without
/// knowing whether it lands on the local dispatcher or a remote daemon.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn schedule(&self, cmd: Command, data: Value) -> Result<()>;
}

/// Scheduler that feeds the daemon's own job lane. The maintenance sweep
/// uses this so its follow-up work flows through the same deduplicating
/// dispatcher as commands arriving off the wire.
pub struct ChannelScheduler {
    tx: tokio::sync::mpsc::Sender<QueueMessage>,
}

impl ChannelScheduler {
    pub fn new(tx: tokio::sync::mpsc::Sender<QueueMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl TaskScheduler for ChannelScheduler {
    async fn schedule(&self, cmd: Command, data: Value) -> Result<()> {
        self.tx
            .send(QueueMessage { cmd, data })
            .await
            .map_err(|_| anyhow::anyhow!("job lane closed"))
    }
}
