//! Docker-backed provider.
//!
//! Each instance is one `code-server` container attached to a shared bridge
//! network. The Docker engine is reached through injected
//! [`CommandExecutor`] and [`ContainerManager`] implementations so that tests
//! can replace the CLI.

pub mod container;
pub mod executor;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{AuthType, InstanceConfig, InstanceStatus, ProviderType, VSCodeInstance};

pub use container::{
    map_container_status, CliContainerManager, ContainerInfo, ContainerManager, ContainerSpec,
    ContainerStats,
};
pub use executor::{CommandExecutor, DockerCli};

use crate::logs;
use crate::provider::{Provider, ProviderBase};
use crate::store::{LocalInstanceStore, MemoryInstanceStore};
use crate::types::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, ProviderCapabilities, ProviderConfig,
    ResourceLimits,
};
use crate::{ProviderError, Result};

/// Label carrying the swarm-wide instance id on every container.
pub const INSTANCE_LABEL: &str = "vscode-swarm.instance-id";

/// Options read from `ProviderConfig::options`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DockerOptions {
    /// Image to run.
    pub image: String,
    /// Shared bridge network.
    pub network: String,
    /// Host name users connect to.
    pub host: String,
    /// Path of the `docker` binary.
    pub docker_binary: String,
    /// Per-instance resource ceiling.
    pub max_resources: ResourceLimits,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            image: "codercom/code-server:latest".to_string(),
            network: "vscode-swarm".to_string(),
            host: "localhost".to_string(),
            docker_binary: "docker".to_string(),
            max_resources: ResourceLimits {
                cpu_cores: 4,
                memory_mb: 8192,
                storage_gb: 100,
            },
        }
    }
}

/// Provider running instances as local Docker containers.
pub struct DockerProvider {
    base: ProviderBase,
    options: DockerOptions,
    executor: Arc<dyn CommandExecutor>,
    containers: Arc<dyn ContainerManager>,
    store: Arc<dyn LocalInstanceStore>,
}

impl DockerProvider {
    /// Build a provider talking to the local `docker` CLI.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` for missing fields or invalid options.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let options: DockerOptions = config.options_as()?;
        let executor: Arc<dyn CommandExecutor> =
            Arc::new(DockerCli::new(options.docker_binary.clone()));
        let containers = Arc::new(CliContainerManager::new(executor.clone()));
        Self::with_collaborators(
            config,
            executor,
            containers,
            Arc::new(MemoryInstanceStore::new()),
        )
    }

    /// Build a provider with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` for missing fields or invalid options.
    pub fn with_collaborators(
        config: &ProviderConfig,
        executor: Arc<dyn CommandExecutor>,
        containers: Arc<dyn ContainerManager>,
        store: Arc<dyn LocalInstanceStore>,
    ) -> Result<Self> {
        let base = ProviderBase::new(config)?;
        if base.provider_type() != ProviderType::Docker {
            return Err(ProviderError::Config(format!(
                "provider type {} cannot back a Docker provider",
                base.provider_type()
            )));
        }

        Ok(Self {
            base,
            options: config.options_as()?,
            executor,
            containers,
            store,
        })
    }

    /// Container name for an instance.
    #[must_use]
    pub fn container_name(instance_id: &InstanceId) -> String {
        format!("vscode-{}", instance_id.short_hex())
    }

    fn build_spec(&self, instance: &VSCodeInstance) -> ContainerSpec {
        let config = &instance.config;
        let mut env = config.env.clone();
        let mut command = vec![
            "--bind-addr".to_string(),
            format!("0.0.0.0:{}", config.container_port()),
        ];

        match &config.auth {
            Some(auth) if auth.auth_type == AuthType::Password => {
                if let Some(password) = &auth.password {
                    env.insert("PASSWORD".to_string(), password.clone());
                }
                command.extend(["--auth".to_string(), "password".to_string()]);
            }
            _ => command.extend(["--auth".to_string(), "none".to_string()]),
        }
        command.push(container::WORKSPACE_MOUNT.to_string());

        // Persistent workspaces live in a named volume that survives `docker rm`.
        let workspace_source = if config.resources.storage.persistent {
            format!("vscode-swarm-{}", instance.id.short_hex())
        } else {
            config.workspace_path.clone()
        };

        ContainerSpec {
            name: instance.provider_instance_id.clone(),
            image: self.options.image.clone(),
            network: self.options.network.clone(),
            container_port: config.container_port(),
            host_port: config.network.port,
            cpu_cores: config.resources.cpu.cores,
            memory_min_mb: config.resources.memory.min,
            memory_max_mb: config.resources.memory.max,
            workspace_source,
            env,
            labels: BTreeMap::from([(INSTANCE_LABEL.to_string(), instance.id.to_hex())]),
            command,
        }
    }

    fn apply_info(&self, instance: &mut VSCodeInstance, info: &ContainerInfo) {
        instance.status = info.status;
        instance.network.internal_ip.clone_from(&info.ip_address);
        instance.network.external_ip.clone_from(&self.options.host);
        instance.network.ports.clone_from(&info.ports);
        instance.network.urls = info
            .ports
            .iter()
            .filter_map(|p| p.host_port)
            .map(|port| format!("http://{}:{port}", self.options.host))
            .collect();
        instance
            .metadata
            .insert("containerId".to_string(), info.id.clone());
        instance
            .metadata
            .insert("dockerState".to_string(), info.state.clone());
        instance.updated_at = Utc::now();
    }

    async fn provision(&self, instance: &mut VSCodeInstance) -> Result<()> {
        let spec = self.build_spec(instance);
        let container_id = self.containers.create(&spec).await?;
        instance
            .metadata
            .insert("containerId".to_string(), container_id);

        self.containers.start(&instance.provider_instance_id).await?;

        for extension in &instance.config.extensions {
            let install = vec![
                "code-server".to_string(),
                "--install-extension".to_string(),
                extension.clone(),
            ];
            match self
                .containers
                .exec(&instance.provider_instance_id, &install)
                .await
            {
                Ok(output) if output.success() => {
                    debug!(instance_id = %instance.id, extension = %extension, "Installed extension");
                }
                Ok(output) => warn!(
                    instance_id = %instance.id,
                    extension = %extension,
                    stderr = %output.stderr.trim(),
                    "Extension install failed"
                ),
                Err(e) => warn!(
                    instance_id = %instance.id,
                    extension = %extension,
                    error = %e,
                    "Extension install failed"
                ),
            }
        }

        let info = self
            .containers
            .inspect(&instance.provider_instance_id)
            .await?
            .ok_or_else(|| {
                ProviderError::Backend(format!(
                    "container {} disappeared after start",
                    instance.provider_instance_id
                ))
            })?;
        self.apply_info(instance, &info);
        Ok(())
    }

    fn load(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.store
            .load(instance_id)?
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_hex()))
    }

    async fn refresh(&self, mut instance: VSCodeInstance) -> Result<VSCodeInstance> {
        match self.containers.inspect(&instance.provider_instance_id).await? {
            None => {
                if instance.status != InstanceStatus::Failed {
                    warn!(instance_id = %instance.id, "Container not found, marking instance failed");
                    instance.mark_failed("Container not found");
                }
            }
            Some(info) => {
                self.apply_info(&mut instance, &info);
                if info.status == InstanceStatus::Running {
                    match self.containers.stats(&instance.provider_instance_id).await {
                        Ok(stats) => {
                            instance.resources.used.cpu_percent = stats.cpu_percent;
                            instance.resources.used.memory_mb = stats.memory_mb;
                        }
                        Err(e) => debug!(instance_id = %instance.id, error = %e, "Stats unavailable"),
                    }
                }
            }
        }
        self.store.save(&instance)?;
        Ok(instance)
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn provider_type(&self) -> ProviderType {
        self.base.provider_type()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn region(&self) -> &str {
        self.base.region()
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_live_resize: true,
            supports_snapshotting: false,
            supports_multi_region: false,
            max_instances_per_user: 10,
            max_resources_per_instance: self.options.max_resources,
        }
    }

    async fn initialize(&self) -> Result<()> {
        self.executor.check_available().await?;

        if self.executor.network_exists(&self.options.network).await? {
            debug!(network = %self.options.network, "Docker network already exists");
        } else {
            self.executor.create_network(&self.options.network).await?;
            info!(network = %self.options.network, "Created Docker network");
        }

        info!(provider = %self.base.name(), "Docker provider initialized");
        Ok(())
    }

    async fn create_instance(&self, config: &InstanceConfig) -> Result<VSCodeInstance> {
        self.validate_instance_config(config)?;

        let id = InstanceId::generate(&config.name);
        let mut instance =
            self.base
                .create_base_instance(id, &config.name, &Self::container_name(&id), config);

        match self.provision(&mut instance).await {
            Ok(()) => {
                self.store.save(&instance)?;
                info!(
                    instance_id = %instance.id,
                    container = %instance.provider_instance_id,
                    status = %instance.status,
                    "Created Docker instance"
                );
                Ok(instance)
            }
            Err(e) => {
                instance.mark_failed(e.to_string());
                if let Err(save_err) = self.store.save(&instance) {
                    warn!(instance_id = %instance.id, error = %save_err, "Failed to record failed instance");
                }
                error!(instance_id = %instance.id, error = %e, "Docker instance creation failed");
                Err(e)
            }
        }
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        match self.store.load(instance_id)? {
            Some(instance) => self.refresh(instance).await.map(Some),
            None => Ok(None),
        }
    }

    async fn list_instances(&self) -> Result<Vec<VSCodeInstance>> {
        let mut out = Vec::new();
        for instance in self.store.list()? {
            out.push(self.refresh(instance).await?);
        }
        Ok(out)
    }

    async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let instance = self.load(instance_id)?;
        self.containers.start(&instance.provider_instance_id).await?;
        info!(instance_id = %instance_id, "Started container");
        self.refresh(instance).await
    }

    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let instance = self.load(instance_id)?;
        self.containers.stop(&instance.provider_instance_id).await?;
        info!(instance_id = %instance_id, "Stopped container");
        self.refresh(instance).await
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let instance = self.load(instance_id)?;
        self.containers.remove(&instance.provider_instance_id).await?;
        self.store.remove(instance_id)?;
        info!(instance_id = %instance_id, "Removed container");
        Ok(())
    }

    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance> {
        let mut instance = self.load(instance_id)?;

        let env_changed = update.env.as_ref().is_some_and(|env| *env != instance.config.env);
        let extensions_changed = update
            .extensions
            .as_ref()
            .is_some_and(|ext| *ext != instance.config.extensions);
        if env_changed || extensions_changed {
            return Err(ProviderError::Config(
                "Changing environment or extensions requires recreating the instance".into(),
            ));
        }

        if let Some(resources) = &update.resources {
            let mut candidate = instance.config.clone();
            candidate.resources = resources.clone();
            self.validate_instance_config(&candidate)?;

            self.containers
                .update_resources(
                    &instance.provider_instance_id,
                    resources.cpu.cores,
                    resources.memory.max,
                )
                .await?;

            instance.config = candidate;
            instance.resources.requested = resources.clone();
            instance.updated_at = Utc::now();
            info!(
                instance_id = %instance_id,
                cpu = resources.cpu.cores,
                memory_mb = resources.memory.max,
                "Resized container"
            );
        }

        self.refresh(instance).await
    }

    async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>> {
        let instance = self.load(instance_id)?;
        let raw = self
            .containers
            .logs(&instance.provider_instance_id, options)
            .await?;
        Ok(logs::apply_options(logs::parse_logs(&raw), options))
    }

    async fn execute_command(
        &self,
        instance_id: &InstanceId,
        command: &[String],
    ) -> Result<CommandOutput> {
        if command.is_empty() {
            return Err(ProviderError::Config("command must not be empty".into()));
        }
        let instance = self.load(instance_id)?;
        self.containers
            .exec(&instance.provider_instance_id, command)
            .await
    }

    async fn adopt_instance(&self, instance: &VSCodeInstance) -> Result<()> {
        if self.store.load(&instance.id)?.is_none() {
            self.store.save(instance)?;
            debug!(instance_id = %instance.id, "Adopted persisted instance");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use vscode_swarm_store::PortMapping;

    #[derive(Default)]
    struct FakeExecutor {
        available: bool,
        networks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for FakeExecutor {
        async fn run(&self, _args: &[String]) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }

        async fn check_available(&self) -> Result<()> {
            if self.available {
                Ok(())
            } else {
                Err(ProviderError::Backend("Docker is not available".into()))
            }
        }

        async fn network_exists(&self, name: &str) -> Result<bool> {
            Ok(self.networks.lock().iter().any(|n| n == name))
        }

        async fn create_network(&self, name: &str) -> Result<()> {
            self.networks.lock().push(name.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeContainers {
        states: Mutex<HashMap<String, String>>,
        fail_start: Mutex<bool>,
        resized: Mutex<Option<(u32, u64)>>,
    }

    #[async_trait]
    impl ContainerManager for FakeContainers {
        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            self.states
                .lock()
                .insert(spec.name.clone(), "created".to_string());
            Ok(format!("id-{}", spec.name))
        }

        async fn start(&self, container_id: &str) -> Result<()> {
            if *self.fail_start.lock() {
                return Err(ProviderError::Backend("port is already allocated".into()));
            }
            self.states
                .lock()
                .insert(container_id.to_string(), "running".to_string());
            Ok(())
        }

        async fn stop(&self, container_id: &str) -> Result<()> {
            self.states
                .lock()
                .insert(container_id.to_string(), "exited".to_string());
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> Result<()> {
            self.states.lock().remove(container_id);
            Ok(())
        }

        async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
            Ok(self.states.lock().get(container_id).map(|state| ContainerInfo {
                id: format!("id-{container_id}"),
                name: container_id.to_string(),
                state: state.clone(),
                status: map_container_status(state),
                ip_address: Some("172.18.0.2".to_string()),
                ports: vec![PortMapping {
                    container_port: 8080,
                    host_port: Some(32768),
                    protocol: "tcp".to_string(),
                }],
            }))
        }

        async fn stats(&self, _container_id: &str) -> Result<ContainerStats> {
            Ok(ContainerStats {
                cpu_percent: 3.0,
                memory_mb: 300,
            })
        }

        async fn logs(&self, _container_id: &str, _options: &LogOptions) -> Result<String> {
            Ok("2024-03-01T10:00:00Z info started\n2024-03-01T10:00:01Z warn slow\n".to_string())
        }

        async fn exec(&self, _container_id: &str, command: &[String]) -> Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: command.join(" "),
                stderr: String::new(),
            })
        }

        async fn update_resources(
            &self,
            _container_id: &str,
            cpu_cores: u32,
            memory_max_mb: u64,
        ) -> Result<()> {
            *self.resized.lock() = Some((cpu_cores, memory_max_mb));
            Ok(())
        }
    }

    fn provider() -> (DockerProvider, Arc<FakeExecutor>, Arc<FakeContainers>) {
        let executor = Arc::new(FakeExecutor {
            available: true,
            ..FakeExecutor::default()
        });
        let containers = Arc::new(FakeContainers::default());
        let provider = DockerProvider::with_collaborators(
            &ProviderConfig::new("docker", "local", "local"),
            executor.clone(),
            containers.clone(),
            Arc::new(MemoryInstanceStore::new()),
        )
        .unwrap();
        (provider, executor, containers)
    }

    fn dev1() -> InstanceConfig {
        let mut config = InstanceConfig::new("dev1", "/src/dev1");
        config.resources.cpu.cores = 2;
        config.resources.memory.max = 2048;
        config
    }

    #[test]
    fn rejects_non_docker_type() {
        let result = DockerProvider::from_config(&ProviderConfig::new("kubernetes", "k", "eu"));
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[tokio::test]
    async fn initialize_creates_network_once() {
        let (provider, executor, _) = provider();
        provider.initialize().await.unwrap();
        provider.initialize().await.unwrap();
        assert_eq!(executor.networks.lock().as_slice(), ["vscode-swarm"]);
    }

    #[tokio::test]
    async fn initialize_fails_when_docker_unavailable() {
        let provider = DockerProvider::with_collaborators(
            &ProviderConfig::new("docker", "local", "local"),
            Arc::new(FakeExecutor::default()),
            Arc::new(FakeContainers::default()),
            Arc::new(MemoryInstanceStore::new()),
        )
        .unwrap();
        assert!(provider.initialize().await.is_err());
    }

    #[tokio::test]
    async fn create_runs_container() {
        let (provider, _, _) = provider();
        let instance = provider.create_instance(&dev1()).await.unwrap();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(
            instance.provider_instance_id,
            DockerProvider::container_name(&instance.id)
        );
        assert_eq!(instance.network.internal_ip.as_deref(), Some("172.18.0.2"));
        assert_eq!(instance.network.urls, vec!["http://localhost:32768"]);
        assert!(instance.metadata.contains_key("containerId"));
    }

    #[tokio::test]
    async fn create_failure_is_recorded_locally() {
        let (provider, _, containers) = provider();
        *containers.fail_start.lock() = true;

        let err = provider.create_instance(&dev1()).await.unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));

        let recorded = provider.store.list().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, InstanceStatus::Failed);
        assert!(recorded[0].error().unwrap().contains("port is already allocated"));
    }

    #[tokio::test]
    async fn create_rejects_oversized_request() {
        let (provider, _, containers) = provider();
        let mut config = dev1();
        config.resources.cpu.cores = 8;

        let err = provider.create_instance(&config).await.unwrap_err();
        assert!(err.to_string().contains("CPU cores exceed maximum"));
        assert!(containers.states.lock().is_empty());
    }

    #[tokio::test]
    async fn get_merges_live_state() {
        let (provider, _, containers) = provider();
        let created = provider.create_instance(&dev1()).await.unwrap();

        let fetched = provider.get_instance(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.resources.used.memory_mb, 300);

        containers.states.lock().clear();
        let lost = provider.get_instance(&created.id).await.unwrap().unwrap();
        assert_eq!(lost.status, InstanceStatus::Failed);
        assert_eq!(lost.error(), Some("Container not found"));
    }

    #[tokio::test]
    async fn stop_start_delete() {
        let (provider, _, _) = provider();
        let created = provider.create_instance(&dev1()).await.unwrap();

        let stopped = provider.stop_instance(&created.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);

        let started = provider.start_instance(&created.id).await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);

        provider.delete_instance(&created.id).await.unwrap();
        assert!(provider.get_instance(&created.id).await.unwrap().is_none());
        assert!(matches!(
            provider.delete_instance(&created.id).await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_resizes_but_rejects_env_change() {
        let (provider, _, containers) = provider();
        let created = provider.create_instance(&dev1()).await.unwrap();

        let mut resources = created.config.resources.clone();
        resources.cpu.cores = 3;
        let update = InstanceUpdate {
            resources: Some(resources),
            ..InstanceUpdate::default()
        };
        let updated = provider.update_instance(&created.id, &update).await.unwrap();
        assert_eq!(updated.config.resources.cpu.cores, 3);
        assert_eq!(*containers.resized.lock(), Some((3, 2048)));

        let env_update = InstanceUpdate {
            env: Some(BTreeMap::from([("A".to_string(), "1".to_string())])),
            ..InstanceUpdate::default()
        };
        let err = provider
            .update_instance(&created.id, &env_update)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires recreating"));
    }

    #[tokio::test]
    async fn logs_are_parsed() {
        let (provider, _, _) = provider();
        let created = provider.create_instance(&dev1()).await.unwrap();
        let entries = provider
            .get_instance_logs(&created.id, &LogOptions::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].level, crate::types::LogLevel::Warn);
    }

    #[tokio::test]
    async fn adopt_restores_shadow_record() {
        let (provider, _, _) = provider();
        let created = provider.create_instance(&dev1()).await.unwrap();

        let (fresh, _, containers) = self::provider();
        containers.states.lock().insert(
            created.provider_instance_id.clone(),
            "running".to_string(),
        );
        assert!(fresh.get_instance(&created.id).await.unwrap().is_none());

        fresh.adopt_instance(&created).await.unwrap();
        let fetched = fresh.get_instance(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InstanceStatus::Running);
    }
}
