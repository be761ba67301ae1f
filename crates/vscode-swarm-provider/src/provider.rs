//! The `Provider` trait and helpers shared by its implementations.

use async_trait::async_trait;
use chrono::Utc;
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{
    InstanceConfig, InstanceNetwork, InstanceResources, InstanceStatus, ProviderType,
    ResourceUsage, VSCodeInstance,
};

use crate::types::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, ProviderCapabilities, ProviderConfig,
};
use crate::{ProviderError, Result};

/// A backend able to realize VS Code instances.
///
/// Every call is keyed by the swarm-wide [`InstanceId`]; the backend handle in
/// `provider_instance_id` never leaves the provider that created it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend kind.
    fn provider_type(&self) -> ProviderType;

    /// Provider name.
    fn name(&self) -> &str;

    /// Region label.
    fn region(&self) -> &str;

    /// Static capabilities of this provider.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Prepare the backend. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable.
    async fn initialize(&self) -> Result<()>;

    /// Check a config against this provider's capabilities.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` naming the offending field.
    fn validate_instance_config(&self, config: &InstanceConfig) -> Result<()> {
        ProviderBase::validate_against(config, &self.capabilities())
    }

    /// Create and start a new instance.
    ///
    /// # Errors
    ///
    /// Returns an error if any backend step fails.
    async fn create_instance(&self, config: &InstanceConfig) -> Result<VSCodeInstance>;

    /// Fetch an instance with its live status merged in.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>>;

    /// List the instances this provider knows about.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn list_instances(&self) -> Result<Vec<VSCodeInstance>>;

    /// Start a stopped instance.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` for unknown instances.
    async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance>;

    /// Stop a running instance.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` for unknown instances.
    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance>;

    /// Remove the backend resource.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::NotFound` for unknown instances.
    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()>;

    /// Apply changes to an existing instance.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` when the change needs a recreate.
    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance>;

    /// Retrieve parsed instance logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot produce logs.
    async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>>;

    /// Run a command inside the instance.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Unsupported` if the backend has no exec.
    async fn execute_command(
        &self,
        instance_id: &InstanceId,
        command: &[String],
    ) -> Result<CommandOutput>;

    /// Lightweight liveness check.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn check_instance_health(&self, instance_id: &InstanceId) -> Result<bool> {
        Ok(self
            .get_instance(instance_id)
            .await?
            .is_some_and(|instance| instance.status == InstanceStatus::Running))
    }

    /// Make a previously persisted instance known to this provider again.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot record the instance.
    async fn adopt_instance(&self, _instance: &VSCodeInstance) -> Result<()> {
        Ok(())
    }
}

/// Identity and shared behavior of a concrete provider.
#[derive(Debug, Clone)]
pub struct ProviderBase {
    provider_type: ProviderType,
    name: String,
    region: String,
}

impl ProviderBase {
    /// Build from a provider config. `type`, `name` and `region` are required.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` naming the first missing or invalid field.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let type_name = required(config.provider_type.as_deref(), "type")?;
        let provider_type = type_name
            .parse::<ProviderType>()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        let name = required(config.name.as_deref(), "name")?;
        let region = required(config.region.as_deref(), "region")?;

        Ok(Self {
            provider_type,
            name: name.to_string(),
            region: region.to_string(),
        })
    }

    /// Build from already validated identity fields.
    #[must_use]
    pub fn from_parts(
        provider_type: ProviderType,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            provider_type,
            name: name.into(),
            region: region.into(),
        }
    }

    /// Backend kind.
    #[must_use]
    pub const fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region label.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Check `config` against the per-instance resource ceiling.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` naming the offending field.
    pub fn validate_against(
        config: &InstanceConfig,
        capabilities: &ProviderCapabilities,
    ) -> Result<()> {
        if config.name.trim().is_empty() {
            return Err(ProviderError::Config("Instance name is required".into()));
        }
        if config.workspace_path.trim().is_empty() {
            return Err(ProviderError::Config("Workspace path is required".into()));
        }

        let max = &capabilities.max_resources_per_instance;
        let resources = &config.resources;

        if resources.cpu.cores > max.cpu_cores {
            return Err(ProviderError::Config(format!(
                "CPU cores exceed maximum ({} > {})",
                resources.cpu.cores, max.cpu_cores
            )));
        }
        if resources.memory.max > max.memory_mb {
            return Err(ProviderError::Config(format!(
                "Memory exceeds maximum ({}MB > {}MB)",
                resources.memory.max, max.memory_mb
            )));
        }
        if resources.storage.size > max.storage_gb {
            return Err(ProviderError::Config(format!(
                "Storage size exceeds maximum ({}GB > {}GB)",
                resources.storage.size, max.storage_gb
            )));
        }
        if resources.memory.min > resources.memory.max {
            return Err(ProviderError::Config(format!(
                "Memory minimum exceeds memory maximum ({}MB > {}MB)",
                resources.memory.min, resources.memory.max
            )));
        }

        Ok(())
    }

    /// Build the canonical record for a freshly requested instance.
    #[must_use]
    pub fn create_base_instance(
        &self,
        id: InstanceId,
        name: &str,
        provider_instance_id: &str,
        config: &InstanceConfig,
    ) -> VSCodeInstance {
        let now = Utc::now();
        VSCodeInstance {
            id,
            name: name.to_string(),
            provider_type: self.provider_type,
            provider_name: self.name.clone(),
            provider_region: self.region.clone(),
            provider_instance_id: provider_instance_id.to_string(),
            status: InstanceStatus::Creating,
            config: config.clone(),
            resources: InstanceResources {
                requested: config.resources.clone(),
                used: ResourceUsage::default(),
            },
            network: InstanceNetwork::default(),
            metadata: std::collections::BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ProviderError::Config(format!(
            "missing required provider field: {field}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceLimits;

    fn capabilities() -> ProviderCapabilities {
        ProviderCapabilities {
            supports_live_resize: true,
            supports_snapshotting: false,
            supports_multi_region: false,
            max_instances_per_user: 10,
            max_resources_per_instance: ResourceLimits {
                cpu_cores: 4,
                memory_mb: 8192,
                storage_gb: 100,
            },
        }
    }

    fn config_with(cores: u32, memory_max: u64, storage: u64) -> InstanceConfig {
        let mut config = InstanceConfig::new("dev1", "/src");
        config.resources.cpu.cores = cores;
        config.resources.memory.max = memory_max;
        config.resources.storage.size = storage;
        config
    }

    #[test]
    fn base_requires_fields_in_order() {
        let mut config = ProviderConfig::new("docker", "local", "eu");
        config.provider_type = None;
        config.name = None;
        let err = ProviderBase::new(&config).unwrap_err();
        assert!(err.to_string().contains("type"));

        let mut config = ProviderConfig::new("docker", "local", "eu");
        config.region = None;
        let err = ProviderBase::new(&config).unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn base_rejects_unknown_type() {
        let config = ProviderConfig::new("firecracker", "local", "eu");
        assert!(matches!(
            ProviderBase::new(&config),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn validation_names_dimension() {
        let caps = capabilities();
        assert!(ProviderBase::validate_against(&config_with(2, 2048, 10), &caps).is_ok());

        let cpu = ProviderBase::validate_against(&config_with(8, 2048, 10), &caps).unwrap_err();
        assert!(cpu.to_string().contains("CPU cores exceed maximum"));

        let mem = ProviderBase::validate_against(&config_with(2, 16384, 10), &caps).unwrap_err();
        assert!(mem.to_string().contains("Memory exceeds maximum"));

        let disk = ProviderBase::validate_against(&config_with(2, 2048, 500), &caps).unwrap_err();
        assert!(disk.to_string().contains("Storage size exceeds maximum"));
    }

    #[test]
    fn validation_requires_name_and_workspace() {
        let caps = capabilities();
        let nameless = InstanceConfig::new("", "/src");
        assert!(ProviderBase::validate_against(&nameless, &caps)
            .unwrap_err()
            .to_string()
            .contains("name"));

        let no_workspace = InstanceConfig::new("dev1", " ");
        assert!(ProviderBase::validate_against(&no_workspace, &caps)
            .unwrap_err()
            .to_string()
            .contains("Workspace path"));
    }

    #[test]
    fn base_instance_envelope() {
        let base = ProviderBase::new(&ProviderConfig::new("docker", "local", "eu")).unwrap();
        let config = InstanceConfig::new("dev1", "/src");
        let id = InstanceId::generate_deterministic("dev1", 1);

        let instance = base.create_base_instance(id, "dev1", "vscode-abc", &config);
        assert_eq!(instance.status, InstanceStatus::Creating);
        assert_eq!(instance.provider_type, ProviderType::Docker);
        assert_eq!(instance.provider_name, "local");
        assert_eq!(instance.provider_region, "eu");
        assert_eq!(instance.network.external_ip, "localhost");
        assert_eq!(instance.resources.used, ResourceUsage::default());
        assert!(instance.metadata.is_empty());
    }
}
