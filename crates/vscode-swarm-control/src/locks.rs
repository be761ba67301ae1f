//! Per-instance mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use vscode_swarm_core::InstanceId;

/// Hands out one async lock per instance id, created on first use.
///
/// A guard spans "read instance, call provider, write registry". Locks for
/// different ids never contend.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `instance_id`.
    pub async fn acquire(&self, instance_id: &InstanceId) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(*instance_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Take the lock only if nobody holds it.
    #[must_use]
    pub fn try_acquire(&self, instance_id: &InstanceId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.lock().entry(*instance_id).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Drop the entry for a deleted instance.
    pub fn remove(&self, instance_id: &InstanceId) {
        self.locks.lock().remove(instance_id);
    }

    /// Number of ids with a lock entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no lock entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
