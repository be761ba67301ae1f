//! In-memory provider for tests.
//!
//! Instances live in a map. Every operation can be made to fail or to stall,
//! and calls are counted per operation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use vscode_swarm_core::InstanceId;
use vscode_swarm_store::{InstanceConfig, InstanceStatus, ProviderType, VSCodeInstance};

use crate::logs;
use crate::provider::{Provider, ProviderBase};
use crate::types::{
    CommandOutput, InstanceUpdate, LogEntry, LogOptions, ProviderCapabilities, ResourceLimits,
};
use crate::{ProviderError, Result};

/// Operations of [`MockProvider`] that can be observed or sabotaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `initialize`
    Initialize,
    /// `create_instance`
    Create,
    /// `get_instance`
    Get,
    /// `list_instances`
    List,
    /// `start_instance`
    Start,
    /// `stop_instance`
    Stop,
    /// `delete_instance`
    Delete,
    /// `update_instance`
    Update,
    /// `get_instance_logs`
    Logs,
    /// `execute_command`
    Exec,
    /// `check_instance_health`
    Health,
}

/// A provider that keeps instances in memory.
///
/// Created instances report `Creating` and become `Running` on the next
/// `get_instance`.
pub struct MockProvider {
    base: ProviderBase,
    capabilities: ProviderCapabilities,
    instances: Mutex<HashMap<InstanceId, VSCodeInstance>>,
    failures: Mutex<HashMap<MockOp, String>>,
    delays: Mutex<HashMap<MockOp, Duration>>,
    calls: Mutex<HashMap<MockOp, usize>>,
    health: Mutex<HashMap<InstanceId, bool>>,
    logs: Mutex<HashMap<InstanceId, String>>,
}

impl MockProvider {
    /// Create a mock named `mock-<type>` in region `local`.
    #[must_use]
    pub fn new(provider_type: ProviderType) -> Self {
        Self::named(provider_type, format!("mock-{provider_type}"), "local")
    }

    /// Create a mock with an explicit name and region.
    #[must_use]
    pub fn named(
        provider_type: ProviderType,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            base: ProviderBase::from_parts(provider_type, name, region),
            capabilities: ProviderCapabilities {
                supports_live_resize: true,
                supports_snapshotting: false,
                supports_multi_region: false,
                max_instances_per_user: 10,
                max_resources_per_instance: ResourceLimits {
                    cpu_cores: 4,
                    memory_mb: 8192,
                    storage_gb: 100,
                },
            },
            instances: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the reported capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make `op` fail with a backend error until cleared.
    pub fn fail_on(&self, op: MockOp, message: impl Into<String>) {
        self.failures.lock().insert(op, message.into());
    }

    /// Stop failing `op`.
    pub fn clear_failure(&self, op: MockOp) {
        self.failures.lock().remove(&op);
    }

    /// Sleep for `delay` before performing `op`.
    pub fn set_delay(&self, op: MockOp, delay: Duration) {
        self.delays.lock().insert(op, delay);
    }

    /// Force the backend status of an instance.
    pub fn set_status(&self, instance_id: &InstanceId, status: InstanceStatus) {
        if let Some(instance) = self.instances.lock().get_mut(instance_id) {
            instance.status = status;
            instance.updated_at = Utc::now();
        }
    }

    /// Override the health check result for an instance.
    pub fn set_healthy(&self, instance_id: &InstanceId, healthy: bool) {
        self.health.lock().insert(*instance_id, healthy);
    }

    /// Drop the health override for an instance.
    pub fn clear_health_override(&self, instance_id: &InstanceId) {
        self.health.lock().remove(instance_id);
    }

    /// Append raw log output for an instance.
    pub fn push_log(&self, instance_id: &InstanceId, line: &str) {
        let mut logs = self.logs.lock();
        let buffer = logs.entry(*instance_id).or_default();
        buffer.push_str(line);
        buffer.push('\n');
    }

    /// Forget an instance as if the backend lost it.
    pub fn remove_backend(&self, instance_id: &InstanceId) {
        self.instances.lock().remove(instance_id);
    }

    /// How many times `op` was called.
    #[must_use]
    pub fn call_count(&self, op: MockOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Number of instances held.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }

    /// Snapshot of an instance without side effects.
    #[must_use]
    pub fn instance(&self, instance_id: &InstanceId) -> Option<VSCodeInstance> {
        self.instances.lock().get(instance_id).cloned()
    }

    async fn enter(&self, op: MockOp) -> Result<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;

        let delay = self.delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.failures.lock().get(&op) {
            Some(message) => Err(ProviderError::Backend(message.clone())),
            None => Ok(()),
        }
    }

    fn modify<F>(&self, instance_id: &InstanceId, f: F) -> Result<VSCodeInstance>
    where
        F: FnOnce(&mut VSCodeInstance),
    {
        let mut instances = self.instances.lock();
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_hex()))?;
        f(instance);
        instance.updated_at = Utc::now();
        Ok(instance.clone())
    }
}

#[async_trait]
impl Provider for MockProvider {
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
        self.capabilities.clone()
    }

    async fn initialize(&self) -> Result<()> {
        self.enter(MockOp::Initialize).await
    }

    async fn create_instance(&self, config: &InstanceConfig) -> Result<VSCodeInstance> {
        self.enter(MockOp::Create).await?;
        self.validate_instance_config(config)?;

        let id = InstanceId::generate(&config.name);
        let mut instance = self.base.create_base_instance(
            id,
            &config.name,
            &format!("mock-{}", id.short_hex()),
            config,
        );
        instance.network.urls = vec![format!("http://localhost:{}", config.container_port())];

        self.instances.lock().insert(id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>> {
        self.enter(MockOp::Get).await?;
        let mut instances = self.instances.lock();
        Ok(instances.get_mut(instance_id).map(|instance| {
            if instance.status == InstanceStatus::Creating {
                instance.status = InstanceStatus::Running;
                instance.updated_at = Utc::now();
            }
            instance.clone()
        }))
    }

    async fn list_instances(&self) -> Result<Vec<VSCodeInstance>> {
        self.enter(MockOp::List).await?;
        let mut all: Vec<_> = self.instances.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn start_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.enter(MockOp::Start).await?;
        self.modify(instance_id, |instance| {
            instance.status = InstanceStatus::Running;
        })
    }

    async fn stop_instance(&self, instance_id: &InstanceId) -> Result<VSCodeInstance> {
        self.enter(MockOp::Stop).await?;
        self.modify(instance_id, |instance| {
            instance.status = InstanceStatus::Stopped;
        })
    }

    async fn delete_instance(&self, instance_id: &InstanceId) -> Result<()> {
        self.enter(MockOp::Delete).await?;
        self.instances
            .lock()
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(instance_id.to_hex()))
    }

    async fn update_instance(
        &self,
        instance_id: &InstanceId,
        update: &InstanceUpdate,
    ) -> Result<VSCodeInstance> {
        self.enter(MockOp::Update).await?;
        if let Some(resources) = &update.resources {
            let mut candidate = self
                .instance(instance_id)
                .ok_or_else(|| ProviderError::NotFound(instance_id.to_hex()))?
                .config;
            candidate.resources = resources.clone();
            self.validate_instance_config(&candidate)?;
        }

        self.modify(instance_id, |instance| {
            if let Some(resources) = &update.resources {
                instance.config.resources = resources.clone();
                instance.resources.requested = resources.clone();
            }
            if let Some(env) = &update.env {
                instance.config.env = env.clone();
            }
            if let Some(extensions) = &update.extensions {
                instance.config.extensions = extensions.clone();
            }
        })
    }

    async fn get_instance_logs(
        &self,
        instance_id: &InstanceId,
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>> {
        self.enter(MockOp::Logs).await?;
        if !self.instances.lock().contains_key(instance_id) {
            return Err(ProviderError::NotFound(instance_id.to_hex()));
        }
        let raw = self.logs.lock().get(instance_id).cloned().unwrap_or_default();
        Ok(logs::apply_options(logs::parse_logs(&raw), options))
    }

    async fn execute_command(
        &self,
        instance_id: &InstanceId,
        command: &[String],
    ) -> Result<CommandOutput> {
        self.enter(MockOp::Exec).await?;
        if !self.instances.lock().contains_key(instance_id) {
            return Err(ProviderError::NotFound(instance_id.to_hex()));
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: command.join(" "),
            stderr: String::new(),
        })
    }

    async fn check_instance_health(&self, instance_id: &InstanceId) -> Result<bool> {
        self.enter(MockOp::Health).await?;
        if let Some(healthy) = self.health.lock().get(instance_id) {
            return Ok(*healthy);
        }
        Ok(self
            .instances
            .lock()
            .get(instance_id)
            .is_some_and(|instance| instance.status == InstanceStatus::Running))
    }

    async fn adopt_instance(&self, instance: &VSCodeInstance) -> Result<()> {
        self.instances
            .lock()
            .entry(instance.id)
            .or_insert_with(|| instance.clone());
        Ok(())
    }
}
