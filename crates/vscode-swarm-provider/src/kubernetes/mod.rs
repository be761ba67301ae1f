//! Kubernetes-backed provider.
//!
//! Each instance is a single `code-server` pod. Stopping an instance deletes
//! its pod while keeping the record; starting it again recreates the pod from
//! the stored config.

pub mod pod;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, DeleteParams, LogParams, ObjectMeta, PostParams};
use kube::Client;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{InstanceConfig, InstanceStatus, PortMapping, ProviderType, VSCodeInstance};

pub use pod::{build_pod, map_pod_phase, pod_name_for_instance};

use crate::logs;
use crate::provider::{Provider, ProviderBase};
use crate::store::{LocalInstanceStore, MemoryInstanceStore};
use crate::types::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, ProviderCapabilities, ProviderConfig,
    ResourceLimits,
};
use crate::{ProviderError, Result};

/// Container waiting reasons that will not resolve on their own.
const FATAL_WAITING_REASONS: [&str; 7] = [
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "CreateContainerError",
    "CreateContainerConfigError",
    "InvalidImageName",
    "RunContainerError",
];

/// Options read from `ProviderConfig::options`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesOptions {
    /// Namespace for instance pods.
    pub namespace: String,
    /// Image to run.
    pub image: String,
    /// Shared claim for persistent workspaces. Without it every workspace is ephemeral.
    pub workspace_pvc: Option<String>,
    /// Per-instance resource ceiling.
    pub max_resources: ResourceLimits,
    /// Timeout for `/healthz` requests in milliseconds.
    pub health_timeout_ms: u64,
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            namespace: "vscode-swarm".to_string(),
            image: "codercom/code-server:latest".to_string(),
            workspace_pvc: None,
            max_resources: ResourceLimits {
                cpu_cores: 8,
                memory_mb: 16384,
                storage_gb: 200,
            },
            health_timeout_ms: 5000,
        }
    }
}

/// Provider running instances as pods in a Kubernetes cluster.
pub struct KubernetesProvider {
    base: ProviderBase,
    options: KubernetesOptions,
    client: OnceCell<Client>,
    store: Arc<dyn LocalInstanceStore>,
    http_client: reqwest::Client,
}

impl KubernetesProvider {
    /// Build a provider that connects to the cluster on `initialize`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` for missing fields or invalid options.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::build(config, OnceCell::new(), Arc::new(MemoryInstanceStore::new()))
    }

    /// Build a provider with a pre-configured client.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` for missing fields or invalid options.
    pub fn with_client(
        config: &ProviderConfig,
        client: Client,
        store: Arc<dyn LocalInstanceStore>,
    ) -> Result<Self> {
        Self::build(config, OnceCell::new_with(Some(client)), store)
    }

    fn build(
        config: &ProviderConfig,
        client: OnceCell<Client>,
        store: Arc<dyn LocalInstanceStore>,
    ) -> Result<Self> {
        let base = ProviderBase::new(config)?;
        if base.provider_type() != ProviderType::Kubernetes {
            return Err(ProviderError::Config(format!(
                "provider type {} cannot back a Kubernetes provider",
                base.provider_type()
            )));
        }
        let options: KubernetesOptions = config.options_as()?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(options.health_timeout_ms))
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base,
            options,
            client,
            store,
            http_client,
        })
    }

    fn pods_api(&self) -> Result<Api<Pod>> {
        let client = self
            .client
            .get()
            .cloned()
            .ok_or_else(|| ProviderError::Backend("Kubernetes provider is not initialized".into()))?;
        Ok(Api::namespaced(client, &self.options.namespace))
    }

    fn load(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.store
            .load(instance_id)?
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_hex()))
    }

    async fn ensure_namespace(&self, client: Client) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(client);
        if namespaces.get_opt(&self.options.namespace).await?.is_some() {
            debug!(namespace = %self.options.namespace, "Namespace already exists");
            return Ok(());
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.options.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %self.options.namespace, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, pod_name: &str) -> Result<()> {
        match self
            .pods_api()?
            .delete(pod_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(pod_name, "Pod not found, already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn apply_pod(instance: &mut VSCodeInstance, pod: &Pod) {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref());
        let port = instance.config.container_port();

        instance.status = map_pod_phase(phase);
        if let Some(message) = container_error(pod) {
            instance.mark_failed(message);
        }

        instance.network.internal_ip = status.and_then(|s| s.pod_ip.clone());
        if let Some(ip) = &instance.network.internal_ip {
            instance.network.external_ip.clone_from(ip);
            instance.network.urls = vec![format!("http://{ip}:{port}")];
        } else {
            instance.network.urls.clear();
        }
        instance.network.ports = vec![PortMapping {
            container_port: port,
            host_port: None,
            protocol: "tcp".to_string(),
        }];

        if let Some(phase) = phase {
            instance
                .metadata
                .insert("podPhase".to_string(), phase.to_string());
        }
        if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
            instance.metadata.insert("node".to_string(), node);
        }
        instance.updated_at = Utc::now();
    }

    async fn refresh(&self, mut instance: VSCodeInstance) -> Result<VSCodeInstance> {
        if instance.status == InstanceStatus::Stopped {
            return Ok(instance);
        }

        match self
            .pods_api()?
            .get_opt(&instance.provider_instance_id)
            .await?
        {
            Some(pod) => Self::apply_pod(&mut instance, &pod),
            None => {
                if instance.status != InstanceStatus::Failed {
                    warn!(instance_id = %instance.id, "Pod not found, marking instance failed");
                    instance.mark_failed("Pod not found");
                }
            }
        }
        self.store.save(&instance)?;
        Ok(instance)
    }
}

/// Detect container states that indicate a persistent failure.
fn container_error(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;

    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref())
        .find_map(|state| {
            if let Some(waiting) = &state.waiting {
                if let Some(reason) = &waiting.reason {
                    if FATAL_WAITING_REASONS.contains(&reason.as_str()) {
                        return Some(waiting.message.clone().unwrap_or_else(|| reason.clone()));
                    }
                }
            }
            state
                .terminated
                .as_ref()
                .filter(|t| t.exit_code != 0)
                .map(|t| {
                    t.message
                        .clone()
                        .or_else(|| t.reason.clone())
                        .unwrap_or_else(|| format!("Exit code: {}", t.exit_code))
                })
        })
}

#[async_trait]
impl Provider for KubernetesProvider {
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
            supports_live_resize: false,
            supports_snapshotting: false,
            supports_multi_region: true,
            max_instances_per_user: 25,
            max_resources_per_instance: self.options.max_resources,
        }
    }

    async fn initialize(&self) -> Result<()> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::try_default().await })
            .await?
            .clone();
        self.ensure_namespace(client).await?;

        info!(
            provider = %self.base.name(),
            namespace = %self.options.namespace,
            "Kubernetes provider initialized"
        );
        Ok(())
    }

    async fn create_instance(&self, config: &InstanceConfig) -> Result<VSCodeInstance> {
        self.validate_instance_config(config)?;

        let id = InstanceId::generate(&config.name);
        let mut instance =
            self.base
                .create_base_instance(id, &config.name, &pod_name_for_instance(&id), config);
        let pod = build_pod(&instance, &self.options);

        let created = match self.pods_api() {
            Ok(pods) => pods
                .create(&PostParams::default(), &pod)
                .await
                .map_err(ProviderError::from),
            Err(e) => Err(e),
        };

        match created {
            Ok(pod) => {
                Self::apply_pod(&mut instance, &pod);
                self.store.save(&instance)?;
                info!(
                    instance_id = %instance.id,
                    pod_name = %instance.provider_instance_id,
                    cpu = config.resources.cpu.cores,
                    memory_mb = config.resources.memory.max,
                    "Created instance pod"
                );
                Ok(instance)
            }
            Err(e) => {
                instance.mark_failed(e.to_string());
                if let Err(save_err) = self.store.save(&instance) {
                    warn!(instance_id = %instance.id, error = %save_err, "Failed to record failed instance");
                }
                error!(instance_id = %instance.id, error = %e, "Pod creation failed");
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
        try_join_all(
            self.store
                .list()?
                .into_iter()
                .map(|instance| self.refresh(instance)),
        )
        .await
    }

    async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let mut instance = self.load(instance_id)?;
        let pods = self.pods_api()?;

        let pod = match pods.get_opt(&instance.provider_instance_id).await? {
            Some(pod) => pod,
            None => {
                let created = pods
                    .create(&PostParams::default(), &build_pod(&instance, &self.options))
                    .await?;
                info!(instance_id = %instance_id, "Recreated instance pod");
                created
            }
        };

        Self::apply_pod(&mut instance, &pod);
        self.store.save(&instance)?;
        Ok(instance)
    }

    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        let mut instance = self.load(instance_id)?;
        self.delete_pod(&instance.provider_instance_id).await?;

        instance.status = InstanceStatus::Stopped;
        instance.network.internal_ip = None;
        instance.network.urls.clear();
        instance.resources.used = vscode_swarm_store::ResourceUsage::default();
        instance.updated_at = Utc::now();
        self.store.save(&instance)?;

        info!(instance_id = %instance_id, "Stopped instance pod");
        Ok(instance)
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let instance = self.load(instance_id)?;
        self.delete_pod(&instance.provider_instance_id).await?;
        self.store.remove(instance_id)?;
        info!(instance_id = %instance_id, "Deleted instance pod");
        Ok(())
    }

    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance> {
        let instance = self.load(instance_id)?;

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
        if update
            .resources
            .as_ref()
            .is_some_and(|r| *r != instance.config.resources)
        {
            return Err(ProviderError::Unsupported(
                "Kubernetes pods cannot be resized in place; recreate the instance".into(),
            ));
        }

        self.refresh(instance).await
    }

    async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>> {
        let instance = self.load(instance_id)?;
        let params = LogParams {
            timestamps: true,
            tail_lines: Some(i64::from(options.lines)),
            since_seconds: options
                .since
                .map(|since| (Utc::now() - since).num_seconds().max(1)),
            ..LogParams::default()
        };

        let raw = self
            .pods_api()?
            .logs(&instance.provider_instance_id, &params)
            .await?;
        Ok(logs::apply_options(logs::parse_logs(&raw), options))
    }

    async fn execute_command(
        &self,
        _instance_id: &InstanceId,
        _command: &[String],
    ) -> Result<CommandOutput> {
        Err(ProviderError::Unsupported(
            "command execution is not available for Kubernetes instances".into(),
        ))
    }

    async fn check_instance_health(&self, instance_id: &InstanceId) -> Result<bool> {
        let instance = self.load(instance_id)?;
        let Some(pod) = self
            .pods_api()?
            .get_opt(&instance.provider_instance_id)
            .await?
        else {
            return Ok(false);
        };

        let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
            return Ok(false);
        };
        let url = format!("http://{ip}:{}/healthz", instance.config.container_port());

        match self.http_client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!(
                    instance_id = %instance_id,
                    status = %resp.status(),
                    "Health check returned non-success status"
                );
                Ok(false)
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "Health check request failed");
                Ok(false)
            }
        }
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
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus,
    };

    fn provider() -> KubernetesProvider {
        KubernetesProvider::from_config(&ProviderConfig::new("kubernetes", "cluster", "eu-west"))
            .unwrap()
    }

    fn instance() -> VSCodeInstance {
        let base = ProviderBase::new(&ProviderConfig::new("kubernetes", "cluster", "eu-west"))
            .unwrap();
        let id = InstanceId::generate_deterministic("dev1", 1);
        base.create_base_instance(
            id,
            "dev1",
            &pod_name_for_instance(&id),
            &InstanceConfig::new("dev1", "/src"),
        )
    }

    fn pod_with(phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn options_from_provider_config() {
        let config = ProviderConfig::new("kubernetes", "cluster", "eu-west").with_options(
            serde_json::json!({"namespace": "dev-envs", "workspacePvc": "shared"}),
        );
        let provider = KubernetesProvider::from_config(&config).unwrap();
        assert_eq!(provider.options.namespace, "dev-envs");
        assert_eq!(provider.options.workspace_pvc.as_deref(), Some("shared"));
        assert!(!provider.capabilities().supports_live_resize);
    }

    #[test]
    fn rejects_non_kubernetes_type() {
        let result = KubernetesProvider::from_config(&ProviderConfig::new("docker", "d", "eu"));
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[test]
    fn running_pod_sets_network() {
        let mut instance = instance();
        KubernetesProvider::apply_pod(&mut instance, &pod_with("Running", Some("10.1.2.3")));
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.network.internal_ip.as_deref(), Some("10.1.2.3"));
        assert_eq!(instance.network.urls, vec!["http://10.1.2.3:8080"]);
        assert_eq!(instance.metadata.get("podPhase").map(String::as_str), Some("Running"));
    }

    #[test]
    fn image_pull_failure_marks_failed() {
        let mut pod = pod_with("Pending", None);
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses = Some(vec![ContainerStatus {
                name: "code-server".to_string(),
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("ImagePullBackOff".to_string()),
                        message: Some("image not found".to_string()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        let mut instance = instance();
        KubernetesProvider::apply_pod(&mut instance, &pod);
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert_eq!(instance.error(), Some("image not found"));
    }

    #[tokio::test]
    async fn calls_before_initialize_fail() {
        let provider = provider();
        let err = provider
            .create_instance(&InstanceConfig::new("dev1", "/src"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        assert_eq!(provider.store.list().unwrap()[0].status, InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn exec_is_unsupported() {
        let provider = provider();
        let err = provider
            .execute_command(&InstanceId::from_bytes([1; 32]), &["ls".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
