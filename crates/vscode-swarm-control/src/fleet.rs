//! The locked core shared by the controller, health monitor and migration
//! manager.
//!
//! Every mutating operation holds the instance's lock from the registry read
//! through the provider call to the registry write. Every provider call is
//! bounded by the configured provider timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vscode_swarm_core::InstanceId;
use vscode_swarm_provider::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, Provider, ProviderError,
};
use vscode_swarm_store::{InstanceConfig, InstanceStatus, ProviderType, VSCodeInstance};

use crate::error::{ControlError, Result};
use crate::filter::InstanceFilter;
use crate::lifecycle::{is_monitored, is_terminal, validate_transition};
use crate::locks::InstanceLocks;
use crate::registry::InstanceRegistry;

/// Metadata key set when an instance needs operator attention.
pub const METADATA_NEEDS_ATTENTION: &str = "needs_attention";

/// Active providers plus the registry, joined by per-instance locks.
pub struct Fleet {
    registry: InstanceRegistry,
    providers: RwLock<HashMap<ProviderType, Arc<dyn Provider>>>,
    locks: InstanceLocks,
    default_provider_type: ProviderType,
    provider_timeout_ms: u64,
}

impl Fleet {
    /// Assemble a fleet from an opened registry.
    #[must_use]
    pub fn new(
        registry: InstanceRegistry,
        default_provider_type: ProviderType,
        provider_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            providers: RwLock::new(HashMap::new()),
            locks: InstanceLocks::new(),
            default_provider_type,
            provider_timeout_ms,
        }
    }

    /// Activate a provider. A provider of the same type is replaced.
    pub fn add_provider(&self, provider: Arc<dyn Provider>) {
        let provider_type = provider.provider_type();
        if self
            .providers
            .write()
            .insert(provider_type, provider)
            .is_some()
        {
            warn!(provider_type = %provider_type, "Replaced active provider");
        }
    }

    /// The registry.
    #[must_use]
    pub const fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// The lock table.
    #[must_use]
    pub const fn locks(&self) -> &InstanceLocks {
        &self.locks
    }

    /// The active provider for a type.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::ProviderUnavailable` if none is active.
    pub fn provider(&self, provider_type: ProviderType) -> Result<Arc<dyn Provider>> {
        self.providers
            .read()
            .get(&provider_type)
            .cloned()
            .ok_or(ControlError::ProviderUnavailable(provider_type))
    }

    /// Types with an active provider, sorted.
    #[must_use]
    pub fn active_provider_types(&self) -> Vec<ProviderType> {
        let mut types: Vec<_> = self.providers.read().keys().copied().collect();
        types.sort();
        types
    }

    /// Run a provider call under the provider timeout.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Timeout` on expiry, or the provider's error.
    pub async fn call_provider<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = vscode_swarm_provider::Result<T>>,
    {
        match tokio::time::timeout(Duration::from_millis(self.provider_timeout_ms), call).await {
            Ok(result) => result.map_err(ControlError::from),
            Err(_) => {
                warn!(operation, timeout_ms = self.provider_timeout_ms, "Provider call timed out");
                Err(ControlError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: self.provider_timeout_ms,
                })
            }
        }
    }

    fn snapshot(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.registry
            .get_instance(instance_id)
            .ok_or(ControlError::InstanceNotFound(*instance_id))
    }

    /// The registry record, provided it is still `Running` or `Creating`.
    /// Recovery paths call this with the instance lock held so a concurrent
    /// stop, delete or migration wins.
    fn monitored_snapshot(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let snapshot = self.snapshot(instance_id)?;
        if is_monitored(snapshot.status) {
            Ok(snapshot)
        } else {
            Err(ControlError::InvalidState {
                instance_id: *instance_id,
                from: snapshot.status,
                to: InstanceStatus::Running,
            })
        }
    }

    /// Create an instance on the given or default provider and register it.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` before any provider call if the config
    /// is rejected. Nothing is registered when the provider fails.
    pub async fn create_instance(
        &self,
        config: &InstanceConfig,
        provider_type: Option<ProviderType>,
    ) -> Result<VSCodeInstance> {
        let provider_type = provider_type.unwrap_or(self.default_provider_type);
        let provider = self.provider(provider_type)?;
        provider.validate_instance_config(config)?;

        let instance = self
            .call_provider("create_instance", provider.create_instance(config))
            .await?;
        self.registry.register_instance(&instance)?;

        info!(
            instance_id = %instance.id,
            name = %instance.name,
            provider_type = %provider_type,
            status = %instance.status,
            "Created instance"
        );
        Ok(instance)
    }

    /// Registry record refreshed from the owning provider when possible.
    ///
    /// # Errors
    ///
    /// Returns an error only if the refreshed record cannot be written back.
    pub async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        if self.registry.get_instance(instance_id).is_none() {
            return Ok(None);
        }

        let _guard = self.locks.acquire(instance_id).await;
        let Some(snapshot) = self.registry.get_instance(instance_id) else {
            return Ok(None);
        };
        let Ok(provider) = self.provider(snapshot.provider_type) else {
            return Ok(Some(snapshot));
        };

        match self
            .call_provider("get_instance", provider.get_instance(instance_id))
            .await
        {
            Ok(Some(live)) => {
                let merged = merge(&snapshot, &live);
                if merged != snapshot {
                    self.registry.update_instance(&merged)?;
                }
                Ok(Some(merged))
            }
            Ok(None) => {
                debug!(instance_id = %instance_id, "Provider has no record, returning snapshot");
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Refresh failed, returning snapshot");
                Ok(Some(snapshot))
            }
        }
    }

    /// Registry records matching `filter`.
    #[must_use]
    pub fn list_instances(&self, filter: Option<&InstanceFilter>) -> Vec<VSCodeInstance> {
        let all = self.registry.list_instances();
        match filter {
            Some(filter) => filter.apply(all),
            None => all,
        }
    }

    /// Start an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound`, `ControlError::InvalidState`
    /// or the provider's error.
    pub async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let snapshot = self.snapshot(instance_id)?;
        if snapshot.status == InstanceStatus::Running {
            return Ok(snapshot);
        }
        validate_transition(instance_id, snapshot.status, InstanceStatus::Running)?;

        let provider = self.provider(snapshot.provider_type)?;
        let live = self
            .call_provider("start_instance", provider.start_instance(instance_id))
            .await?;
        let merged = merge(&snapshot, &live);
        self.registry.update_instance(&merged)?;

        info!(instance_id = %instance_id, status = %merged.status, "Started instance");
        Ok(merged)
    }

    /// Stop an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound`, `ControlError::InvalidState`
    /// or the provider's error.
    pub async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let snapshot = self.snapshot(instance_id)?;
        if snapshot.status == InstanceStatus::Stopped {
            return Ok(snapshot);
        }
        validate_transition(instance_id, snapshot.status, InstanceStatus::Stopped)?;

        let provider = self.provider(snapshot.provider_type)?;
        let live = self
            .call_provider("stop_instance", provider.stop_instance(instance_id))
            .await?;
        let merged = merge(&snapshot, &live);
        self.registry.update_instance(&merged)?;

        info!(instance_id = %instance_id, "Stopped instance");
        Ok(merged)
    }

    /// Delete an instance. The registry entry is removed only after the
    /// provider confirms.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or the provider's error, in
    /// which case the registry is unchanged.
    pub async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let guard = self.locks.acquire(instance_id).await;
        let snapshot = self.snapshot(instance_id)?;
        validate_transition(instance_id, snapshot.status, InstanceStatus::Deleted)?;

        let provider = self.provider(snapshot.provider_type)?;
        match self
            .call_provider("delete_instance", provider.delete_instance(instance_id))
            .await
        {
            Ok(()) => {}
            Err(ControlError::Provider(ProviderError::NotFound(_))) => {
                warn!(instance_id = %instance_id, "Provider no longer knows instance, removing record");
            }
            Err(e) => return Err(e),
        }

        self.registry.remove_instance(instance_id)?;
        drop(guard);
        self.locks.remove(instance_id);

        info!(instance_id = %instance_id, "Deleted instance");
        Ok(())
    }

    /// Apply an update.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` before any provider call if the new
    /// resources exceed the provider's limits.
    pub async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let snapshot = self.snapshot(instance_id)?;
        if update.is_empty() {
            return Ok(snapshot);
        }
        if is_terminal(snapshot.status) {
            return Err(ControlError::Config(format!(
                "instance {instance_id} is {} and cannot be updated",
                snapshot.status
            )));
        }

        let provider = self.provider(snapshot.provider_type)?;
        let mut candidate = snapshot.config.clone();
        if let Some(resources) = &update.resources {
            candidate.resources = resources.clone();
        }
        provider.validate_instance_config(&candidate)?;

        let live = self
            .call_provider(
                "update_instance",
                provider.update_instance(instance_id, update),
            )
            .await?;
        let mut merged = merge(&snapshot, &live);
        merged.config = live.config;
        merged.resources.requested = live.resources.requested;
        self.registry.update_instance(&merged)?;

        info!(instance_id = %instance_id, "Updated instance");
        Ok(merged)
    }

    /// Parsed logs from the owning provider.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or the provider's error.
    pub async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>> {
        let snapshot = self.snapshot(instance_id)?;
        let provider = self.provider(snapshot.provider_type)?;
        self.call_provider(
            "get_instance_logs",
            provider.get_instance_logs(instance_id, options),
        )
        .await
    }

    /// Run a command inside an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` for an empty command,
    /// `ControlError::InstanceNotFound`, or the provider's error.
    pub async fn execute_command(
        &self,
        instance_id: &InstanceId,
        command: &[String],
    ) -> Result<CommandOutput> {
        if command.is_empty() {
            return Err(ControlError::Config("command must not be empty".into()));
        }
        let _guard = self.locks.acquire(instance_id).await;
        let snapshot = self.snapshot(instance_id)?;
        let provider = self.provider(snapshot.provider_type)?;
        self.call_provider(
            "execute_command",
            provider.execute_command(instance_id, command),
        )
        .await
    }

    /// Stop then start an instance through its provider. The registry is
    /// written only when the start succeeds.
    ///
    /// # Errors
    ///
    /// Returns the start error; a failed stop is only logged.
    pub async fn restart_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let _guard = self.locks.acquire(instance_id).await;
        let snapshot = self.monitored_snapshot(instance_id)?;
        let provider = self.provider(snapshot.provider_type)?;

        if let Err(e) = self
            .call_provider("stop_instance", provider.stop_instance(instance_id))
            .await
        {
            debug!(instance_id = %instance_id, error = %e, "Stop before restart failed");
        }
        let live = self
            .call_provider("start_instance", provider.start_instance(instance_id))
            .await?;
        let merged = merge(&snapshot, &live);
        self.registry.update_instance(&merged)?;

        info!(instance_id = %instance_id, status = %merged.status, "Restarted instance");
        Ok(merged)
    }

    /// Replace an instance with a new one built from the same config on the
    /// same provider. Returns the new instance; the old id is removed.
    ///
    /// # Errors
    ///
    /// Returns the creation error, in which case the old instance is kept.
    pub async fn recreate_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let guard = self.locks.acquire(instance_id).await;
        let snapshot = self.monitored_snapshot(instance_id)?;
        let provider = self.provider(snapshot.provider_type)?;

        let replacement = self
            .call_provider("create_instance", provider.create_instance(&snapshot.config))
            .await?;
        self.registry.register_instance(&replacement)?;

        if let Err(e) = self
            .call_provider("delete_instance", provider.delete_instance(instance_id))
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "Failed to delete replaced instance");
        }
        self.registry.remove_instance(instance_id)?;
        drop(guard);
        self.locks.remove(instance_id);

        info!(
            instance_id = %instance_id,
            replacement_id = %replacement.id,
            "Recreated instance"
        );
        Ok(replacement)
    }

    /// Record an unrecoverable instance as failed and flag it.
    ///
    /// Returns `None` without writing when the instance has meanwhile left
    /// `Running`/`Creating`, for example after a user stop.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or a store error.
    pub async fn mark_failed(
        &self,
        instance_id: &InstanceId,
        reason: &str,
    ) -> Result<Option<VSCodeInstance>> {
        let _guard = self.locks.acquire(instance_id).await;
        let mut instance = self.snapshot(instance_id)?;
        if !is_monitored(instance.status) {
            debug!(
                instance_id = %instance_id,
                status = %instance.status,
                "Instance left monitored state, not marking failed"
            );
            return Ok(None);
        }
        validate_transition(instance_id, instance.status, InstanceStatus::Failed)?;
        instance.mark_failed(reason);
        instance
            .metadata
            .insert(METADATA_NEEDS_ATTENTION.to_string(), "true".to_string());
        self.registry.update_instance(&instance)?;

        warn!(instance_id = %instance_id, reason, "Instance marked failed");
        Ok(Some(instance))
    }
}

/// Fold a provider's live record into the registry snapshot.
///
/// Terminal registry statuses are kept.
fn merge(snapshot: &VSCodeInstance, live: &VSCodeInstance) -> VSCodeInstance {
    let mut merged = snapshot.clone();
    if !is_terminal(snapshot.status) {
        merged.status = live.status;
    }
    merged.network = live.network.clone();
    merged.resources.used = live.resources.used.clone();
    merged
        .metadata
        .extend(live.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    if merged != *snapshot {
        merged.updated_at = Utc::now();
    }
    merged
}
