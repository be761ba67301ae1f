//! Swarm-wide instance registry.
//!
//! The registry is the authority on which ids exist. It keeps every record in
//! memory and writes each mutation through to a [`Store`] before the memory
//! map changes, so a failed write leaves both sides unchanged.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{RocksStore, Store, StoreError, VSCodeInstance};

use crate::error::{ControlError, Result};

/// In-memory instance map with write-through persistence.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, VSCodeInstance>>,
    store: RwLock<Option<Arc<dyn Store>>>,
}

impl InstanceRegistry {
    /// Create a registry over an existing store. Nothing is loaded yet.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            store: RwLock::new(Some(store)),
        }
    }

    /// Open a `RocksDB` store under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be opened.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| {
            ControlError::Store(StoreError::Database(format!(
                "cannot create {}: {e}",
                state_dir.display()
            )))
        })?;
        let store = RocksStore::open(state_dir.join("instances"))?;
        Ok(Self::new(Arc::new(store)))
    }

    fn store(&self) -> Result<Arc<dyn Store>> {
        self.store
            .read()
            .clone()
            .ok_or(ControlError::Store(StoreError::Closed))
    }

    /// Replace the in-memory map with the persisted records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(&self) -> Result<usize> {
        let records = self.store()?.list_instances()?;
        let count = records.len();

        let mut instances = self.instances.write();
        instances.clear();
        instances.extend(records.into_iter().map(|r| (r.id, r)));

        info!(count, "Loaded persisted instances");
        Ok(count)
    }

    /// Add a new instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if the id is already registered, or a
    /// store error if the write fails.
    pub fn register_instance(&self, instance: &VSCodeInstance) -> Result<()> {
        if self.instances.read().contains_key(&instance.id) {
            return Err(ControlError::Config(format!(
                "instance {} is already registered",
                instance.id
            )));
        }
        self.store()?.put_instance(instance)?;
        self.instances.write().insert(instance.id, instance.clone());

        debug!(instance_id = %instance.id, status = %instance.status, "Registered instance");
        Ok(())
    }

    /// Replace an existing instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` for unknown ids, or a store
    /// error if the write fails.
    pub fn update_instance(&self, instance: &VSCodeInstance) -> Result<()> {
        if !self.instances.read().contains_key(&instance.id) {
            return Err(ControlError::InstanceNotFound(instance.id));
        }
        self.store()?.put_instance(instance)?;
        self.instances.write().insert(instance.id, instance.clone());
        Ok(())
    }

    /// Remove an instance, returning the last record.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails.
    pub fn remove_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        match self.store()?.delete_instance(instance_id) {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        let removed = self.instances.write().remove(instance_id);
        if removed.is_some() {
            debug!(instance_id = %instance_id, "Removed instance");
        }
        Ok(removed)
    }

    /// Get an instance by id.
    #[must_use]
    pub fn get_instance(&self, instance_id: &InstanceId) -> Option<VSCodeInstance> {
        self.instances.read().get(instance_id).cloned()
    }

    /// All instances in creation order.
    #[must_use]
    pub fn list_instances(&self) -> Vec<VSCodeInstance> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Number of registered instances.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Flush pending writes to disk.
    ///
    /// # Errors
    ///
    /// Returns a store error if the registry is disposed or the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.store()?.flush()?;
        Ok(())
    }

    /// Flush and release the store. Later mutations fail with a store error.
    /// Calling this again does nothing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the final flush fails. The handle is released
    /// either way.
    pub fn dispose(&self) -> Result<()> {
        let Some(store) = self.store.write().take() else {
            return Ok(());
        };
        store.flush()?;
        info!("Instance registry disposed");
        Ok(())
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.store.read().is_none()
    }
}
