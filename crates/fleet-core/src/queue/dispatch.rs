//! In-flight deduplicating dispatcher
//!
//! One spawned task per distinct task signature. A duplicate submission
//! while an instance is in flight is a no-op, which is what keeps two
//! near-simultaneous maintenance sweeps from double-scheduling the same
//! container's cleanup. Handler failures are logged and swallowed; the
//! signature is always deregistered on completion so later retries stay
//! possible.

use super::{task_signature, Command, TaskScheduler};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes one command; implemented by the orchestrator.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, cmd: Command, data: Value) -> Result<()>;
}

pub struct Dispatcher {
    handler: Arc<dyn TaskHandler>,
    in_flight: Arc<DashMap<String, ()>>,
}

/// Removes the signature when the worker task finishes, panicking
/// handlers included.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, ()>>,
    signature: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.signature);
    }
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            handler,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Number of distinct tasks currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Spawn a worker for the command unless an identical one is already
    /// in flight. Returns whether a worker was spawned.
    pub fn submit(&self, cmd: Command, data: Value) -> Result<bool> {
        let signature = task_signature(cmd.into(), &data)?;
        // entry() holds the shard lock across the check-and-insert, so
        // two racing submissions cannot both pass
        match self.in_flight.entry(signature.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(cmd = ?cmd, signature = %signature, "duplicate task dropped");
                Ok(false)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                let guard = InFlightGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    signature,
                };
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = handler.handle(cmd, data).await {
                        warn!(cmd = ?cmd, error = %err, "task handler failed");
                    }
                });
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl TaskScheduler for Dispatcher {
    async fn schedule(&self, cmd: Command, data: Value) -> Result<()> {
        self.submit(cmd, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Handler that counts invocations and blocks until released.
    struct GatedHandler {
        calls: AtomicUsize,
        release: Notify,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for GatedHandler {
        async fn handle(&self, _cmd: Command, _data: Value) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_is_dropped() {
        let handler = GatedHandler::new();
        let dispatcher = Dispatcher::new(handler.clone());
        let data = json!({"container_id": "c1", "name": "_abc_0"});

        assert!(dispatcher.submit(Command::BackupCleanup, data.clone()).unwrap());
        settle().await;
        assert!(!dispatcher.submit(Command::BackupCleanup, data.clone()).unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.in_flight_count(), 1);

        // a different container is separate work
        assert!(dispatcher
            .submit(Command::BackupCleanup, json!({"container_id": "c2", "name": "_def_0"}))
            .unwrap());
        settle().await;

        handler.release.notify_waiters();
        settle().await;
        assert_eq!(dispatcher.in_flight_count(), 0);

        // completion makes the signature submittable again
        assert!(dispatcher.submit(Command::BackupCleanup, data).unwrap());
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _cmd: Command, _data: Value) -> Result<()> {
            bail!("container runtime unavailable")
        }
    }

    #[tokio::test]
    async fn test_failure_deregisters_signature() {
        let dispatcher = Dispatcher::new(Arc::new(FailingHandler));
        let data = json!({"container_id": "c1"});

        assert!(dispatcher.submit(Command::Delete, data.clone()).unwrap());
        settle().await;
        assert_eq!(dispatcher.in_flight_count(), 0);
        assert!(dispatcher.submit(Command::Delete, data).unwrap());
    }
}
