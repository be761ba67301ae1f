//! The fleet controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vscode_swarm_core::{InstanceId, PlanId};
use vscode_swarm_provider::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, Provider, ProviderFactory,
};
use vscode_swarm_store::{InstanceConfig, ProviderType, VSCodeInstance};

use crate::config::ControllerConfig;
use crate::error::{ControlError, Result};
use crate::filter::InstanceFilter;
use crate::fleet::Fleet;
use crate::health::{HealthMonitor, HealthRecord, RecoveryOutcome};
use crate::migration::{MigrationManager, MigrationOptions, MigrationPlan, MigrationResult};
use crate::registry::InstanceRegistry;

struct Components {
    fleet: Arc<Fleet>,
    health: Arc<HealthMonitor>,
    migration: Arc<MigrationManager>,
    shutdown: watch::Sender<bool>,
    auto_save: Mutex<Option<JoinHandle<()>>>,
}

/// Composes the registry, providers, health monitor and migration manager.
pub struct SwarmController {
    config: ControllerConfig,
    factory: Arc<ProviderFactory>,
    components: RwLock<Option<Arc<Components>>>,
    disposing: AtomicBool,
}

impl SwarmController {
    /// Create a controller with the Docker and Kubernetes providers available.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_factory(config, Arc::new(ProviderFactory::with_defaults()))
    }

    /// Create a controller with a custom provider factory.
    #[must_use]
    pub fn with_factory(config: ControllerConfig, factory: Arc<ProviderFactory>) -> Self {
        Self {
            config,
            factory,
            components: RwLock::new(None),
            disposing: AtomicBool::new(false),
        }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Whether `initialize` has completed and `dispose` has not run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.components.read().is_some()
    }

    fn components(&self) -> Result<Arc<Components>> {
        self.components
            .read()
            .clone()
            .ok_or(ControlError::NotInitialized)
    }

    /// Open the registry, activate providers and start background tasks.
    ///
    /// A provider that fails to construct or initialize is logged and left
    /// out. Calling this on an initialized controller does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be opened or loaded.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            warn!("Controller already initialized");
            return Ok(());
        }
        let general = &self.config.general;

        let registry = InstanceRegistry::open(&general.state_dir)?;
        if general.load_state_on_startup {
            registry.load()?;
        }
        let fleet = Arc::new(Fleet::new(
            registry,
            general.default_provider_type,
            general.provider_timeout_ms,
        ));

        for provider_config in self.config.providers.iter().filter(|p| p.enabled) {
            let label = provider_config.name.as_deref().unwrap_or("<unnamed>");
            let provider = match self.factory.create_provider(provider_config) {
                Ok(provider) => provider,
                Err(e) => {
                    error!(provider = label, error = %e, "Failed to construct provider");
                    continue;
                }
            };
            if fleet.provider(provider.provider_type()).is_ok() {
                warn!(
                    provider = label,
                    provider_type = %provider.provider_type(),
                    "Duplicate provider type, skipping"
                );
                continue;
            }
            if let Err(e) = fleet.call_provider("initialize", provider.initialize()).await {
                error!(provider = label, error = %e, "Failed to initialize provider");
                continue;
            }

            info!(
                provider = label,
                provider_type = %provider.provider_type(),
                region = %provider.region(),
                "Provider active"
            );
            fleet.add_provider(provider);
        }
        if fleet.active_provider_types().is_empty() {
            warn!("No providers active");
        }

        Self::adopt_persisted(&fleet).await;

        let migration = Arc::new(MigrationManager::new(
            Arc::clone(&fleet),
            self.config.migration.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&fleet),
            Some(Arc::clone(&migration)),
            self.config.health_monitor.clone(),
        ));
        if self.config.health_monitor.enabled {
            health.start();
        }

        let (shutdown, _) = watch::channel(false);
        let auto_save = Self::spawn_auto_save(&fleet, &shutdown, general.auto_save_interval_ms);

        *self.components.write() = Some(Arc::new(Components {
            fleet,
            health,
            migration,
            shutdown,
            auto_save: Mutex::new(auto_save),
        }));

        info!(
            state_dir = %general.state_dir.display(),
            default_provider = %general.default_provider_type,
            "Controller initialized"
        );
        Ok(())
    }

    async fn adopt_persisted(fleet: &Fleet) {
        for instance in fleet.registry().list_instances() {
            let Ok(provider) = fleet.provider(instance.provider_type) else {
                debug!(instance_id = %instance.id, "Owning provider inactive, not adopting");
                continue;
            };
            if let Err(e) = fleet
                .call_provider("adopt_instance", provider.adopt_instance(&instance))
                .await
            {
                warn!(instance_id = %instance.id, error = %e, "Failed to adopt persisted instance");
            }
        }
    }

    fn spawn_auto_save(
        fleet: &Arc<Fleet>,
        shutdown: &watch::Sender<bool>,
        interval_ms: u64,
    ) -> Option<JoinHandle<()>> {
        if interval_ms == 0 {
            return None;
        }
        let fleet = Arc::clone(fleet);
        let mut shutdown = shutdown.subscribe();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = fleet.registry().flush() {
                            warn!(error = %e, "Registry auto-save failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }

    /// Create an instance on `provider_type`, or the default provider.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` before any provider call for invalid
    /// configs, or the provider's error. Nothing is registered on failure.
    pub async fn create_instance(
        &self,
        config: &InstanceConfig,
        provider_type: Option<ProviderType>,
    ) -> Result<VSCodeInstance> {
        self.components()?
            .fleet
            .create_instance(config, provider_type)
            .await
    }

    /// An instance, refreshed from its provider when possible.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`, or a store error on write-back.
    pub async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        self.components()?.fleet.get_instance(instance_id).await
    }

    /// Registered instances matching `filter`, in creation order.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn list_instances(&self, filter: Option<&InstanceFilter>) -> Result<Vec<VSCodeInstance>> {
        Ok(self.components()?.fleet.list_instances(filter))
    }

    /// Start an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound`, `ControlError::InvalidState`
    /// or the provider's error.
    pub async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.components()?.fleet.start_instance(instance_id).await
    }

    /// Stop an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound`, `ControlError::InvalidState`
    /// or the provider's error.
    pub async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.components()?.fleet.stop_instance(instance_id).await
    }

    /// Delete an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or the provider's error.
    pub async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        self.components()?.fleet.delete_instance(instance_id).await
    }

    /// Update an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` for invalid resources, or the provider's
    /// error.
    pub async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance> {
        self.components()?
            .fleet
            .update_instance(instance_id, update)
            .await
    }

    /// Parsed instance logs.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or the provider's error.
    pub async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>> {
        self.components()?
            .fleet
            .get_instance_logs(instance_id, options)
            .await
    }

    /// Run a command inside an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound` or the provider's error.
    pub async fn execute_command(
        &self,
        instance_id: &InstanceId,
        command: &[String],
    ) -> Result<CommandOutput> {
        self.components()?
            .fleet
            .execute_command(instance_id, command)
            .await
    }

    /// Types with an active provider.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn active_provider_types(&self) -> Result<Vec<ProviderType>> {
        Ok(self.components()?.fleet.active_provider_types())
    }

    /// The active provider of a type.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::ProviderUnavailable` if none is active.
    pub fn provider(&self, provider_type: ProviderType) -> Result<Arc<dyn Provider>> {
        self.components()?.fleet.provider(provider_type)
    }

    /// Health record of an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn get_health(&self, instance_id: &InstanceId) -> Result<Option<HealthRecord>> {
        Ok(self.components()?.health.get_health(instance_id))
    }

    /// All health records.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn list_health(&self) -> Result<Vec<HealthRecord>> {
        Ok(self.components()?.health.list_health())
    }

    /// Run one health tick now.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub async fn run_health_check(&self) -> Result<Vec<HealthRecord>> {
        Ok(self.components()?.health.check_all().await)
    }

    /// Run one recovery attempt for an instance.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InstanceNotFound`, or `ControlError::Internal`
    /// if a recovery is already running for it.
    pub async fn recover_instance(&self, instance_id: &InstanceId) -> Result<RecoveryOutcome> {
        self.components()?.health.recover_instance(instance_id).await
    }

    /// Plan a migration to another provider type.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if migration is disabled or the target
    /// is the current provider type.
    pub fn create_migration_plan(
        &self,
        source_instance_id: &InstanceId,
        target_provider_type: ProviderType,
        options: &MigrationOptions,
    ) -> Result<MigrationPlan> {
        self.components()?.migration.create_migration_plan(
            source_instance_id,
            target_provider_type,
            options,
        )
    }

    /// Execute a pending plan.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::PlanNotFound` or `ControlError::InvalidPlanState`.
    pub async fn start_migration(&self, plan_id: &PlanId) -> Result<MigrationResult> {
        self.components()?.migration.start_migration(plan_id).await
    }

    /// Cancel a pending or running plan.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::PlanNotFound` or `ControlError::InvalidPlanState`.
    pub fn cancel_migration(&self, plan_id: &PlanId) -> Result<MigrationPlan> {
        self.components()?.migration.cancel_migration(plan_id)
    }

    /// A plan by id.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn get_migration_plan(&self, plan_id: &PlanId) -> Result<Option<MigrationPlan>> {
        Ok(self.components()?.migration.get_migration_plan(plan_id))
    }

    /// All plans, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotInitialized`.
    pub fn list_migration_plans(&self) -> Result<Vec<MigrationPlan>> {
        Ok(self.components()?.migration.list_migration_plans())
    }

    /// Tear everything down. Each component is disposed independently and
    /// failures are logged. The controller reports uninitialized only once
    /// all of them have been attempted. Calling this again does nothing.
    pub async fn dispose(&self) {
        let Some(components) = self.components.read().clone() else {
            debug!("Controller already disposed");
            return;
        };
        if self.disposing.swap(true, Ordering::SeqCst) {
            debug!("Controller dispose already in progress");
            return;
        }

        if let Err(e) = components.health.dispose().await {
            error!(error = %e, "Failed to dispose health monitor");
        }
        components.migration.dispose();

        components.shutdown.send_replace(true);
        let auto_save = components.auto_save.lock().take();
        if let Some(task) = auto_save {
            if let Err(e) = task.await {
                error!(error = %e, "Auto-save task failed");
            }
        }

        if let Err(e) = components.fleet.registry().dispose() {
            error!(error = %e, "Failed to dispose instance registry");
        }

        *self.components.write() = None;
        self.disposing.store(false, Ordering::SeqCst);
        info!("Controller disposed");
    }
}
