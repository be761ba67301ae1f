//! Provider-local shadow records.
//!
//! Each provider keeps its own copy of the instances it created, keyed by the
//! swarm-wide id, so it can translate ids into backend handles. The swarm-wide
//! registry is a separate store, reconciled by the controller.

use std::collections::HashMap;

use parking_lot::RwLock;
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::VSCodeInstance;

use crate::Result;

/// Storage for a provider's shadow records.
pub trait LocalInstanceStore: Send + Sync {
    /// Insert or replace a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn save(&self, instance: &VSCodeInstance) -> Result<()>;

    /// Load a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn load(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>>;

    /// Remove a record, returning it if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be removed.
    fn remove(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>>;

    /// All records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read.
    fn list(&self) -> Result<Vec<VSCodeInstance>>;
}

/// In-memory shadow store.
#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    records: RwLock<HashMap<InstanceId, VSCodeInstance>>,
}

impl MemoryInstanceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl LocalInstanceStore for MemoryInstanceStore {
    fn save(&self, instance: &VSCodeInstance) -> Result<()> {
        self.records.write().insert(instance.id, instance.clone());
        Ok(())
    }

    fn load(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        Ok(self.records.read().get(instance_id).cloned())
    }

    fn remove(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        Ok(self.records.write().remove(instance_id))
    }

    fn list(&self) -> Result<Vec<VSCodeInstance>> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}
