//! Wire message and command definitions

use super::QueueError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Command codes carried on the wire. Codes are part of the protocol;
/// never renumber an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Command {
    /// Back up a session's home directory, then delete the container.
    BackupCleanup = 1,
    /// Create/start a session container for an owner.
    LaunchSession = 2,
    /// Delete a container without a backup pass.
    Delete = 3,
    /// Reconcile the disk-slot table against live containers.
    RefreshSlots = 4,
    /// Sample host resources and publish the node load figure.
    CollectStats = 5,
    /// RPC: map of session name to human status string.
    SessionStatus = 6,
    /// RPC: whether the queried node may terminate itself.
    TerminationCheck = 7,
}

impl From<Command> for i32 {
    fn from(cmd: Command) -> i32 {
        cmd as i32
    }
}

impl TryFrom<i32> for Command {
    type Error = QueueError;

    fn try_from(code: i32) -> Result<Self, QueueError> {
        match code {
            1 => Ok(Command::BackupCleanup),
            2 => Ok(Command::LaunchSession),
            3 => Ok(Command::Delete),
            4 => Ok(Command::RefreshSlots),
            5 => Ok(Command::CollectStats),
            6 => Ok(Command::SessionStatus),
            7 => Ok(Command::TerminationCheck),
            other => Err(QueueError::UnknownCommand(other)),
        }
    }
}

/// One signed wire message: `{cmd, data, sign}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: i32,
    pub data: Value,
    pub sign: String,
}

/// A verified fire-and-forget command handed to the daemon loop.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub cmd: Command,
    pub data: Value,
}

/// A verified RPC request awaiting a reply. Dropping the sender without
/// replying surfaces as an I/O error to the remote caller.
#[derive(Debug)]
pub struct RpcRequest {
    pub cmd: Command,
    pub data: Value,
    pub reply: oneshot::Sender<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCleanupArgs {
    pub name: String,
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteArgs {
    pub name: String,
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSessionArgs {
    pub name: String,
    pub owner: String,
    pub reuse: bool,
}
