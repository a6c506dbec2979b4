//! Per-workflow execution locks.
//!
//! Webhook deliveries and schedule ticks may race on the same workflow.
//! Execution within one workflow must be exclusive, while unrelated
//! workflows run concurrently, so the arena hands out one async mutex per
//! workflow id. Acquisition never waits: a contended attempt resolves to
//! a skipped execution at the call site.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Arena of per-workflow execution locks, keyed by workflow id.
#[derive(Clone, Default)]
pub struct LockArena {
    locks: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the execution lock for a workflow without waiting.
    ///
    /// Returns `None` when a previous execution of the same workflow still
    /// holds the lock. The guard releases on drop, covering every terminal
    /// outcome (success, error, skipped).
    pub fn try_acquire(&self, workflow_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().expect("lock arena poisoned");
            locks
                .entry(workflow_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }
}
