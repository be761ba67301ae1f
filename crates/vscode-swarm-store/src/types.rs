//! Domain types stored in the database.
//!
//! These types represent the persisted state of VS Code instances and the
//! configuration they were created from.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vscode_swarm_core::InstanceId;

/// Metadata key carrying the last error for a failed instance.
pub const METADATA_ERROR: &str = "error";

/// Default port the VS Code server listens on inside its container.
pub const DEFAULT_VSCODE_PORT: u16 = 8080;

/// Backend kinds able to realize instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Local Docker engine.
    Docker,
    /// Kubernetes cluster.
    Kubernetes,
}

impl ProviderType {
    /// All recognized provider types.
    pub const ALL: [Self; 2] = [Self::Docker, Self::Kubernetes];

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = UnknownProviderType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            _ => Err(UnknownProviderType(s.to_string())),
        }
    }
}

/// Returned when a string does not name a recognized provider type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider type: {0}")]
pub struct UnknownProviderType(pub String);

/// Lifecycle states for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Backend resource is being provisioned.
    Creating,
    /// VS Code server is up.
    Running,
    /// Backend resource exists but is not running.
    Stopped,
    /// Unrecoverable provider error. Terminal for this id.
    Failed,
    /// Removed from the backend. Terminal for this id.
    Deleted,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// CPU allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// Number of cores.
    pub cores: u32,
}

/// Memory allocation in megabytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Guaranteed memory (MB).
    pub min: u64,
    /// Memory limit (MB).
    pub max: u64,
}

/// Workspace storage allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Size in gigabytes.
    pub size: u64,
    /// Whether the workspace outlives the backend resource.
    #[serde(default)]
    pub persistent: bool,
}

/// Requested resources for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// CPU allocation.
    pub cpu: CpuConfig,
    /// Memory allocation.
    pub memory: MemoryConfig,
    /// Storage allocation.
    pub storage: StorageConfig,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            cpu: CpuConfig { cores: 1 },
            memory: MemoryConfig {
                min: 512,
                max: 2048,
            },
            storage: StorageConfig {
                size: 10,
                persistent: false,
            },
        }
    }
}

/// Network settings requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host port to publish. `None` lets the backend choose.
    #[serde(default)]
    pub port: Option<u16>,
}

/// How users authenticate against the VS Code server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// No authentication.
    #[default]
    None,
    /// Shared password.
    Password,
}

/// Authentication settings for the VS Code server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication scheme.
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    /// Password when `auth_type` is `Password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Configuration an instance is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// Human-readable name.
    pub name: String,
    /// Workspace directory mounted into the instance.
    pub workspace_path: String,
    /// Requested resources.
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Environment variables for the VS Code server.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Authentication settings.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Extensions to install on first start.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl InstanceConfig {
    /// Create a config with default resources.
    #[must_use]
    pub fn new(name: impl Into<String>, workspace_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workspace_path: workspace_path.into(),
            resources: ResourceConfig::default(),
            network: NetworkConfig::default(),
            env: BTreeMap::new(),
            auth: None,
            extensions: Vec::new(),
        }
    }

    /// Replace the requested resources.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    /// Port the VS Code server listens on inside the backend resource.
    #[must_use]
    pub fn container_port(&self) -> u16 {
        DEFAULT_VSCODE_PORT
    }
}

/// Observed resource consumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Memory usage in megabytes.
    pub memory_mb: u64,
    /// Storage usage in gigabytes.
    pub storage_gb: u64,
}

/// Requested versus used resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResources {
    /// What the config asked for.
    pub requested: ResourceConfig,
    /// What the backend reports.
    pub used: ResourceUsage,
}

/// A published port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the backend resource.
    pub container_port: u16,
    /// Port reachable from outside, if published.
    pub host_port: Option<u16>,
    /// Transport protocol.
    pub protocol: String,
}

/// Network view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetwork {
    /// Address inside the backend network.
    pub internal_ip: Option<String>,
    /// Address users connect to.
    pub external_ip: String,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// URLs of the VS Code server.
    pub urls: Vec<String>,
}

impl Default for InstanceNetwork {
    fn default() -> Self {
        Self {
            internal_ip: None,
            external_ip: "localhost".to_string(),
            ports: Vec::new(),
            urls: Vec::new(),
        }
    }
}

/// A VS Code instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VSCodeInstance {
    /// Unique identifier for the instance.
    pub id: InstanceId,
    /// Human-readable name.
    pub name: String,
    /// Backend kind owning this instance.
    pub provider_type: ProviderType,
    /// Name of the owning provider.
    pub provider_name: String,
    /// Region of the owning provider.
    pub provider_region: String,
    /// Opaque backend handle, only meaningful to `provider_type`.
    pub provider_instance_id: String,
    /// Current lifecycle state.
    pub status: InstanceStatus,
    /// Configuration the instance was created from.
    pub config: InstanceConfig,
    /// Resource accounting.
    pub resources: InstanceResources,
    /// Network addresses and URLs.
    pub network: InstanceNetwork,
    /// Provider-specific data, `error` on failure.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl VSCodeInstance {
    /// Transition to `Failed`, keeping config and metadata for diagnosis.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = InstanceStatus::Failed;
        self.metadata
            .insert(METADATA_ERROR.to_string(), error.into());
        self.updated_at = Utc::now();
    }

    /// The recorded error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.metadata.get(METADATA_ERROR).map(String::as_str)
    }
}
