//! Controller harness backed by in-memory providers.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use vscode_swarm_control::{ControllerConfig, InstanceConfig, SwarmController, VSCodeInstance};
use vscode_swarm_provider::{MockProvider, Provider, ProviderConfig, ProviderFactory, Result};
use vscode_swarm_store::ProviderType;

pub struct Harness {
    pub dir: TempDir,
    pub controller: Arc<SwarmController>,
    pub docker: Arc<MockProvider>,
    pub kubernetes: Arc<MockProvider>,
}

/// Config with both provider types, no background tasks and short timeouts.
pub fn test_config(state_dir: &Path) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.general.state_dir = state_dir.to_path_buf();
    config.general.auto_save_interval_ms = 0;
    config.general.provider_timeout_ms = 2_000;
    config.health_monitor.enabled = false;
    config.health_monitor.unhealthy_threshold = 1;
    config.providers = vec![
        ProviderConfig::new("docker", "local-docker", "local"),
        ProviderConfig::new("kubernetes", "local-k8s", "local"),
    ];
    config
}

/// A factory that hands out the given mocks regardless of options.
pub fn mock_factory(docker: &Arc<MockProvider>, kubernetes: &Arc<MockProvider>) -> Arc<ProviderFactory> {
    let factory = ProviderFactory::new();
    for mock in [docker, kubernetes] {
        let mock = Arc::clone(mock);
        factory.register_provider(
            mock.provider_type(),
            Arc::new(move |_: &ProviderConfig| -> Result<Arc<dyn Provider>> {
                Ok(Arc::clone(&mock) as Arc<dyn Provider>)
            }),
        );
    }
    Arc::new(factory)
}

impl Harness {
    /// Build an uninitialized controller over fresh mocks.
    pub fn build(dir: TempDir, tweak: impl FnOnce(&mut ControllerConfig)) -> Self {
        let docker = Arc::new(MockProvider::new(ProviderType::Docker));
        let kubernetes = Arc::new(MockProvider::new(ProviderType::Kubernetes));
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let controller = Arc::new(SwarmController::with_factory(
            config,
            mock_factory(&docker, &kubernetes),
        ));
        Self {
            dir,
            controller,
            docker,
            kubernetes,
        }
    }

    /// Build and initialize with the default test config.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Build and initialize after adjusting the config.
    pub async fn start_with(tweak: impl FnOnce(&mut ControllerConfig)) -> Self {
        let harness = Self::build(tempfile::tempdir().unwrap(), tweak);
        harness.controller.initialize().await.unwrap();
        harness
    }

    /// Create an instance on Docker and refresh it to `Running`.
    pub async fn running_instance(&self, name: &str) -> VSCodeInstance {
        let created = self
            .controller
            .create_instance(&InstanceConfig::new(name, format!("/src/{name}")), None)
            .await
            .unwrap();
        self.controller
            .get_instance(&created.id)
            .await
            .unwrap()
            .unwrap()
    }
}
