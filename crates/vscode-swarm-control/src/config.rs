//! Controller configuration.
//!
//! Read from a camelCase JSON document where every field has a default, then
//! adjusted from the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vscode_swarm_provider::ProviderConfig;
use vscode_swarm_store::ProviderType;

use crate::error::{ControlError, Result};
use crate::migration::MigrationStrategy;

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// State directory, default provider and persistence.
    pub general: GeneralConfig,
    /// Providers to activate.
    pub providers: Vec<ProviderConfig>,
    /// Health polling and recovery.
    pub health_monitor: HealthMonitorConfig,
    /// Cross-provider migration.
    pub migration: MigrationConfig,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralConfig {
    /// Directory holding the instance database.
    pub state_dir: PathBuf,
    /// Provider used when a create request names none.
    pub default_provider_type: ProviderType,
    /// Reload persisted instances on startup.
    pub load_state_on_startup: bool,
    /// Flush interval for the registry, 0 disables the task.
    pub auto_save_interval_ms: u64,
    /// Budget for every provider call.
    pub provider_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/vscode-swarm"),
            default_provider_type: ProviderType::Docker,
            load_state_on_startup: true,
            auto_save_interval_ms: 30_000,
            provider_timeout_ms: 60_000,
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthMonitorConfig {
    /// Run the polling loop.
    pub enabled: bool,
    /// Interval between ticks.
    pub check_interval_ms: u64,
    /// Trigger recovery once the threshold is crossed.
    pub auto_recover: bool,
    /// Recovery attempts before an instance is given up on.
    pub max_recovery_attempts: u32,
    /// Observations kept per instance.
    pub history_size: usize,
    /// Consecutive unhealthy observations before recovery.
    pub unhealthy_threshold: u32,
    /// Enabled recovery actions.
    pub recovery_actions: RecoveryActionsConfig,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            auto_recover: true,
            max_recovery_attempts: 3,
            history_size: 10,
            unhealthy_threshold: 3,
            recovery_actions: RecoveryActionsConfig::default(),
        }
    }
}

/// Which recovery actions may be used, in ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoveryActionsConfig {
    /// Restart through the owning provider.
    pub restart: bool,
    /// Replace with a new instance on the same provider.
    pub recreate: bool,
    /// Move to another active provider.
    pub migrate: bool,
}

impl Default for RecoveryActionsConfig {
    fn default() -> Self {
        Self {
            restart: true,
            recreate: true,
            migrate: false,
        }
    }
}

/// Migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationConfig {
    /// Allow plan creation.
    pub enabled: bool,
    /// Strategy used when a request names none.
    pub default_strategy: MigrationStrategy,
    /// Lifetime of a plan from creation.
    pub timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: MigrationStrategy::StopAndRecreate,
            timeout_ms: 600_000,
        }
    }
}

impl ControllerConfig {
    /// Load from a JSON file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControlError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| ControlError::Config(format!("invalid config {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults with environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `SWARM_STATE_DIR`, `SWARM_DEFAULT_PROVIDER` and
    /// `SWARM_HEALTH_INTERVAL_MS`. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("SWARM_STATE_DIR") {
            self.general.state_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SWARM_DEFAULT_PROVIDER") {
            if let Ok(provider_type) = val.parse() {
                self.general.default_provider_type = provider_type;
            }
        }
        if let Ok(val) = std::env::var("SWARM_HEALTH_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.health_monitor.check_interval_ms = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.general.default_provider_type, ProviderType::Docker);
        assert_eq!(config.health_monitor.max_recovery_attempts, 3);
        assert!(config.health_monitor.recovery_actions.restart);
        assert!(!config.health_monitor.recovery_actions.migrate);
        assert_eq!(config.migration.default_strategy, MigrationStrategy::StopAndRecreate);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn camel_case_document() {
        let config: ControllerConfig = serde_json::from_value(serde_json::json!({
            "general": {
                "stateDir": "/tmp/swarm",
                "defaultProviderType": "kubernetes",
                "autoSaveIntervalMs": 0
            },
            "providers": [
                {"type": "docker", "name": "local", "region": "eu-west", "options": {"network": "dev"}},
                {"type": "kubernetes", "enabled": false, "name": "cluster", "region": "us-east"}
            ],
            "healthMonitor": {
                "checkIntervalMs": 1000,
                "recoveryActions": {"restart": false, "migrate": true}
            },
            "migration": {"defaultStrategy": "create_then_stop", "timeoutMs": 5000}
        }))
        .unwrap();

        assert_eq!(config.general.state_dir, PathBuf::from("/tmp/swarm"));
        assert_eq!(config.general.default_provider_type, ProviderType::Kubernetes);
        assert_eq!(config.general.auto_save_interval_ms, 0);
        assert_eq!(config.providers.len(), 2);
        assert!(config.providers[0].enabled);
        assert!(!config.providers[1].enabled);
        assert_eq!(config.health_monitor.check_interval_ms, 1000);
        assert!(!config.health_monitor.recovery_actions.restart);
        assert!(config.health_monitor.recovery_actions.recreate);
        assert_eq!(config.migration.default_strategy, MigrationStrategy::CreateThenStop);
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = ControllerConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("swarm.json"));

        std::fs::write(&path, r#"{"migration": {"enabled": false}}"#).unwrap();
        let config = ControllerConfig::from_file(&path).unwrap();
        assert!(!config.migration.enabled);
    }
}
