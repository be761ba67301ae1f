//! Types shared by every provider.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vscode_swarm_store::ResourceConfig;

use crate::{ProviderError, Result};

/// Upper bounds a single instance may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Maximum CPU cores.
    pub cpu_cores: u32,
    /// Maximum memory limit in megabytes.
    pub memory_mb: u64,
    /// Maximum workspace storage in gigabytes.
    pub storage_gb: u64,
}

/// What a provider can do. Fixed for the lifetime of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    /// Resources can change without recreating the backend resource.
    pub supports_live_resize: bool,
    /// The backend can snapshot workspaces.
    pub supports_snapshotting: bool,
    /// The provider can place instances in more than one region.
    pub supports_multi_region: bool,
    /// Maximum instances a single user may own.
    pub max_instances_per_user: u32,
    /// Per-instance resource ceiling checked before any backend call.
    pub max_resources_per_instance: ResourceLimits,
}

/// Configuration used to construct a provider.
///
/// `type`, `name` and `region` are optional at the serde level so that the
/// factory can report which one is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider type name, e.g. `docker`.
    #[serde(rename = "type", default)]
    pub provider_type: Option<String>,
    /// Whether the controller should activate this provider.
    #[serde(default = "ProviderConfig::default_enabled")]
    pub enabled: bool,
    /// Provider name, unique within a fleet.
    #[serde(default)]
    pub name: Option<String>,
    /// Region label.
    #[serde(default)]
    pub region: Option<String>,
    /// Provider-specific options.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl ProviderConfig {
    const fn default_enabled() -> bool {
        true
    }

    /// Create an enabled config with no options.
    #[must_use]
    pub fn new(
        provider_type: impl Into<String>,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            provider_type: Some(provider_type.into()),
            enabled: true,
            name: Some(name.into()),
            region: Some(region.into()),
            options: serde_json::Value::Null,
        }
    }

    /// Attach provider-specific options.
    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Deserialize the provider-specific options, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if the options do not match `T`.
    pub fn options_as<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.options.clone())
            .map_err(|e| ProviderError::Config(format!("invalid provider options: {e}")))
    }
}

/// Severity inferred from a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Error.
    Error,
    /// Warning.
    Warn,
    /// Informational.
    Info,
    /// Debug output.
    Debug,
    /// No level could be inferred.
    Unknown,
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Timestamp prefix, if the backend emitted one.
    pub timestamp: Option<DateTime<Utc>>,
    /// Inferred severity.
    pub level: LogLevel,
    /// Remaining text.
    pub message: String,
}

/// Options for retrieving instance logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// Maximum number of log lines to return.
    #[serde(default = "LogOptions::default_lines")]
    pub lines: u32,
    /// Only return entries at or after this timestamp.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Only return entries at or before this timestamp.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            lines: Self::default_lines(),
            since: None,
            until: None,
        }
    }
}

impl LogOptions {
    const fn default_lines() -> u32 {
        100
    }

    /// Create options to get the last N lines.
    #[must_use]
    pub const fn tail(lines: u32) -> Self {
        Self {
            lines,
            since: None,
            until: None,
        }
    }
}

/// Result of running a command inside an instance or on the backend host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into `ProviderError::Backend` naming the operation.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if the command failed.
    pub fn into_result(self, operation: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProviderError::Backend(format!(
                "{operation} failed (exit {}): {}",
                self.exit_code,
                self.stderr.trim()
            )))
        }
    }
}

/// Changes requested for an existing instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUpdate {
    /// New resource allocation.
    #[serde(default)]
    pub resources: Option<ResourceConfig>,
    /// New environment variables.
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    /// New extension list.
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
}

impl InstanceUpdate {
    /// Whether the update contains no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_none() && self.env.is_none() && self.extensions.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Opts {
        #[serde(default)]
        image: Option<String>,
    }

    #[test]
    fn provider_config_from_json() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"type":"docker","name":"local","region":"eu","options":{"image":"x"}}"#,
        )
        .unwrap();
        assert_eq!(config.provider_type.as_deref(), Some("docker"));
        assert!(config.enabled);
        let opts: Opts = config.options_as().unwrap();
        assert_eq!(opts.image.as_deref(), Some("x"));
    }

    #[test]
    fn null_options_use_default() {
        let config = ProviderConfig::new("docker", "local", "eu");
        let opts: Opts = config.options_as().unwrap();
        assert_eq!(opts, Opts::default());
    }

    #[test]
    fn log_options_defaults() {
        let opts = LogOptions::default();
        assert_eq!(opts.lines, 100);
        assert!(opts.since.is_none());
    }

    #[test]
    fn command_output_into_result() {
        let ok = CommandOutput::default();
        assert!(ok.into_result("docker start").is_ok());

        let failed = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "no such container\n".to_string(),
        };
        let err = failed.into_result("docker start").unwrap_err();
        assert!(err.to_string().contains("docker start failed (exit 1): no such container"));
    }
}
