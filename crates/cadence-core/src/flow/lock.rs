//! Per-execution mutual exclusion.
//!
//! Every `advance` holds the execution's mutex for the whole
//! load-mutate-persist cycle. A second caller for the same id waits up to the
//! configured timeout and then observes the committed state; if the wait
//! times out it reports lock contention. Entries are removed once nobody
//! holds or waits on them, so the map only grows with concurrently active ids.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

/// Registry of per-execution mutexes.
#[derive(Clone, Default)]
pub struct ExecutionLocks {
    locks: Arc<LockMap>,
}

/// Held while an execution is being advanced.
pub struct ExecutionLockGuard {
    id: Uuid,
    locks: Arc<LockMap>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ExecutionLockGuard {
    fn drop(&mut self) {
        // Map + this guard = 2. Anyone else means a waiter is queued.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the execution's lock. `None` on timeout.
    pub async fn acquire(&self, id: Uuid, timeout: Duration) -> Option<ExecutionLockGuard> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = tokio::time::timeout(timeout, lock.lock_owned()).await.ok()?;
        Some(ExecutionLockGuard {
            id,
            locks: self.locks.clone(),
            _guard: guard,
        })
    }

    /// Number of ids currently held or awaited.
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}
