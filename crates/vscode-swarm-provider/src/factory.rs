//! Registry of provider constructors keyed by provider type.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use vscode_swarm_store::ProviderType;

use crate::docker::DockerProvider;
use crate::kubernetes::KubernetesProvider;
use crate::provider::{Provider, ProviderBase};
use crate::types::ProviderConfig;
use crate::{ProviderError, Result};

/// Builds a provider from its config.
pub type ProviderConstructor =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Maps provider types to constructors.
///
/// Each controller owns its own factory, so tests can register mocks without
/// touching any global state.
#[derive(Default)]
pub struct ProviderFactory {
    constructors: RwLock<HashMap<ProviderType, ProviderConstructor>>,
}

impl ProviderFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with the Docker and Kubernetes providers registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let factory = Self::new();
        factory.register_provider(
            ProviderType::Docker,
            Arc::new(|config: &ProviderConfig| -> Result<Arc<dyn Provider>> {
                Ok(Arc::new(DockerProvider::from_config(config)?))
            }),
        );
        factory.register_provider(
            ProviderType::Kubernetes,
            Arc::new(|config: &ProviderConfig| -> Result<Arc<dyn Provider>> {
                Ok(Arc::new(KubernetesProvider::from_config(config)?))
            }),
        );
        factory
    }

    /// Register or replace the constructor for a type.
    pub fn register_provider(&self, provider_type: ProviderType, constructor: ProviderConstructor) {
        debug!(provider_type = %provider_type, "Registered provider constructor");
        self.constructors.write().insert(provider_type, constructor);
    }

    /// Register a constructor by type name.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if the name is not a known provider type.
    pub fn register_provider_named(
        &self,
        type_name: &str,
        constructor: ProviderConstructor,
    ) -> Result<()> {
        let provider_type = type_name
            .parse::<ProviderType>()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        self.register_provider(provider_type, constructor);
        Ok(())
    }

    /// Build a provider, checking `type`, `name` and `region` first.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if a field is missing, the type is not
    /// registered, or the constructor rejects the config.
    pub fn create_provider(&self, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        let base = ProviderBase::new(config)?;

        let constructor = self
            .constructors
            .read()
            .get(&base.provider_type())
            .cloned()
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "provider type {} is not registered",
                    base.provider_type()
                ))
            })?;

        constructor(config)
    }

    /// Registered types, in declaration order.
    #[must_use]
    pub fn provider_types(&self) -> Vec<ProviderType> {
        let mut types: Vec<_> = self.constructors.read().keys().copied().collect();
        types.sort();
        types
    }

    /// Whether a constructor is registered for `provider_type`.
    #[must_use]
    pub fn is_provider_registered(&self, provider_type: ProviderType) -> bool {
        self.constructors.read().contains_key(&provider_type)
    }

    /// Remove every registration.
    pub fn reset(&self) {
        self.constructors.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn mock_constructor() -> ProviderConstructor {
        Arc::new(|config: &ProviderConfig| -> Result<Arc<dyn Provider>> {
            let base = ProviderBase::new(config)?;
            Ok(Arc::new(MockProvider::named(
                base.provider_type(),
                base.name(),
                base.region(),
            )))
        })
    }

    #[test]
    fn defaults_register_both_types() {
        let factory = ProviderFactory::with_defaults();
        assert_eq!(
            factory.provider_types(),
            vec![ProviderType::Docker, ProviderType::Kubernetes]
        );
    }

    #[test]
    fn missing_fields_reported_in_order() {
        let factory = ProviderFactory::with_defaults();

        let mut config = ProviderConfig::new("docker", "local", "eu");
        config.region = None;
        let err = factory.create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("missing required provider field: region"));

        config.name = None;
        let err = factory.create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("missing required provider field: name"));

        config.provider_type = None;
        let err = factory.create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("missing required provider field: type"));
    }

    #[test]
    fn unregistered_type_rejected() {
        let factory = ProviderFactory::new();
        factory.register_provider(ProviderType::Docker, mock_constructor());

        let err = factory
            .create_provider(&ProviderConfig::new("kubernetes", "k", "eu"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not registered"));

        let provider = factory
            .create_provider(&ProviderConfig::new("docker", "local", "eu"))
            .unwrap();
        assert_eq!(provider.name(), "local");
        assert_eq!(provider.region(), "eu");
    }

    #[test]
    fn named_registration_and_reset() {
        let factory = ProviderFactory::new();
        assert!(factory
            .register_provider_named("nomad", mock_constructor())
            .is_err());
        factory
            .register_provider_named("k8s", mock_constructor())
            .unwrap();
        assert!(factory.is_provider_registered(ProviderType::Kubernetes));

        factory.reset();
        assert!(factory.provider_types().is_empty());
    }
}
