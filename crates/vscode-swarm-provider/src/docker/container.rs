//! Container lifecycle on top of a [`CommandExecutor`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use vscode_swarm_store::{InstanceStatus, PortMapping};

use super::executor::{args, CommandExecutor};
use crate::types::{CommandOutput, LogOptions};
use crate::{ProviderError, Result};

/// Where the workspace is mounted inside the container.
pub const WORKSPACE_MOUNT: &str = "/home/coder/project";

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Network to attach to.
    pub network: String,
    /// Port the VS Code server listens on inside the container.
    pub container_port: u16,
    /// Host port to publish, or `None` for an ephemeral port.
    pub host_port: Option<u16>,
    /// CPU limit in cores.
    pub cpu_cores: u32,
    /// Memory reservation in megabytes.
    pub memory_min_mb: u64,
    /// Memory limit in megabytes.
    pub memory_max_mb: u64,
    /// Host path (or named volume) mounted at [`WORKSPACE_MOUNT`].
    pub workspace_source: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
    /// Arguments passed to the image entrypoint.
    pub command: Vec<String>,
}

/// Live view of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Full container id.
    pub id: String,
    /// Container name without the leading slash.
    pub name: String,
    /// Raw Docker state, e.g. `running`.
    pub state: String,
    /// `state` mapped onto [`InstanceStatus`].
    pub status: InstanceStatus,
    /// First non-empty network address.
    pub ip_address: Option<String>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerStats {
    /// CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory usage in megabytes.
    pub memory_mb: u64,
}

/// Map a Docker container state onto [`InstanceStatus`].
#[must_use]
pub fn map_container_status(state: &str) -> InstanceStatus {
    match state.to_ascii_lowercase().as_str() {
        "running" => InstanceStatus::Running,
        "exited" | "paused" => InstanceStatus::Stopped,
        "created" | "restarting" => InstanceStatus::Creating,
        _ => InstanceStatus::Failed,
    }
}

/// Container operations used by the Docker provider.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Create a container, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if Docker rejects the request.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if Docker rejects the request.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Stop a container.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if Docker rejects the request.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Force-remove a container. Missing containers are not an error.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if Docker rejects the request.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Inspect a container, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the output cannot be parsed.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>>;

    /// Sample resource usage.
    ///
    /// # Errors
    ///
    /// Returns an error if stats are unavailable.
    async fn stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Raw, timestamped log output.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if logs cannot be read.
    async fn logs(&self, container_id: &str, options: &LogOptions) -> Result<String>;

    /// Run a command in the container.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if the exec cannot be started.
    async fn exec(&self, container_id: &str, command: &[String]) -> Result<CommandOutput>;

    /// Change CPU and memory limits in place.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if Docker rejects the request.
    async fn update_resources(
        &self,
        container_id: &str,
        cpu_cores: u32,
        memory_max_mb: u64,
    ) -> Result<()>;
}

/// [`ContainerManager`] driving the `docker` CLI.
pub struct CliContainerManager {
    executor: Arc<dyn CommandExecutor>,
}

impl CliContainerManager {
    /// Create a manager on top of `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let publish = match spec.host_port {
            Some(host) => format!("{host}:{}", spec.container_port),
            None => spec.container_port.to_string(),
        };

        let mut out = args(&["create", "--name", &spec.name, "--network", &spec.network]);
        out.extend(args(&["-p", &publish]));
        out.extend(args(&["--cpus", &spec.cpu_cores.to_string()]));
        out.extend(args(&["--memory", &format!("{}m", spec.memory_max_mb)]));
        out.extend(args(&[
            "--memory-reservation",
            &format!("{}m", spec.memory_min_mb),
        ]));
        out.extend(args(&[
            "-v",
            &format!("{}:{WORKSPACE_MOUNT}", spec.workspace_source),
        ]));
        for (key, value) in &spec.env {
            out.extend(args(&["-e", &format!("{key}={value}")]));
        }
        for (key, value) in &spec.labels {
            out.extend(args(&["--label", &format!("{key}={value}")]));
        }
        out.push(spec.image.clone());
        out.extend(spec.command.iter().cloned());
        out
    }
}

#[async_trait]
impl ContainerManager for CliContainerManager {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self
            .executor
            .run(&Self::create_args(spec))
            .await?
            .into_result("docker create")?;
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(ProviderError::Backend(
                "docker create returned no container id".into(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.executor
            .run(&args(&["start", container_id]))
            .await?
            .into_result("docker start")
            .map(|_| ())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.executor
            .run(&args(&["stop", container_id]))
            .await?
            .into_result("docker stop")
            .map(|_| ())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let output = self.executor.run(&args(&["rm", "-f", container_id])).await?;
        if output.success() || is_missing(&output) {
            Ok(())
        } else {
            output.into_result("docker rm").map(|_| ())
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerInfo>> {
        let output = self.executor.run(&args(&["inspect", container_id])).await?;
        if is_missing(&output) {
            return Ok(None);
        }
        let output = output.into_result("docker inspect")?;
        parse_inspect(&output.stdout)
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let output = self
            .executor
            .run(&args(&[
                "stats",
                "--no-stream",
                "--format",
                "{{json .}}",
                container_id,
            ]))
            .await?
            .into_result("docker stats")?;
        parse_stats(&output.stdout)
    }

    async fn logs(&self, container_id: &str, options: &LogOptions) -> Result<String> {
        let mut cmd = args(&["logs", "--timestamps", "--tail", &options.lines.to_string()]);
        if let Some(since) = options.since {
            cmd.extend(args(&["--since", &since.to_rfc3339()]));
        }
        if let Some(until) = options.until {
            cmd.extend(args(&["--until", &until.to_rfc3339()]));
        }
        cmd.push(container_id.to_string());

        let output = self.executor.run(&cmd).await?.into_result("docker logs")?;
        // The container's stderr stream arrives on our stderr.
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<CommandOutput> {
        let mut cmd = args(&["exec", container_id]);
        cmd.extend(command.iter().cloned());
        self.executor.run(&cmd).await
    }

    async fn update_resources(
        &self,
        container_id: &str,
        cpu_cores: u32,
        memory_max_mb: u64,
    ) -> Result<()> {
        let memory = format!("{memory_max_mb}m");
        self.executor
            .run(&args(&[
                "update",
                "--cpus",
                &cpu_cores.to_string(),
                "--memory",
                &memory,
                "--memory-swap",
                &memory,
                container_id,
            ]))
            .await?
            .into_result("docker update")
            .map(|_| ())
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    !output.success()
        && (output.stderr.contains("No such container") || output.stderr.contains("No such object"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    name: String,
    state: InspectState,
    #[serde(default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: HashMap<String, InspectNetwork>,
    #[serde(default)]
    ports: HashMap<String, Option<Vec<InspectPortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectPortBinding {
    #[serde(default)]
    host_port: String,
}

fn parse_inspect(stdout: &str) -> Result<Option<ContainerInfo>> {
    let mut parsed: Vec<InspectOutput> = serde_json::from_str(stdout)?;
    if parsed.is_empty() {
        return Ok(None);
    }
    let raw = parsed.swap_remove(0);

    let ip_address = raw
        .network_settings
        .networks
        .values()
        .map(|n| n.ip_address.trim())
        .find(|ip| !ip.is_empty())
        .map(str::to_string);

    let mut ports: Vec<PortMapping> = raw
        .network_settings
        .ports
        .iter()
        .filter_map(|(key, bindings)| {
            let (port, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            let container_port = port.parse().ok()?;
            let host_port = bindings
                .as_ref()
                .and_then(|b| b.iter().find_map(|binding| binding.host_port.parse().ok()));
            Some(PortMapping {
                container_port,
                host_port,
                protocol: protocol.to_string(),
            })
        })
        .collect();
    ports.sort_by_key(|p| p.container_port);

    Ok(Some(ContainerInfo {
        id: raw.id,
        name: raw.name.trim_start_matches('/').to_string(),
        status: map_container_status(&raw.state.status),
        state: raw.state.status,
        ip_address,
        ports,
    }))
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
}

fn parse_stats(stdout: &str) -> Result<ContainerStats> {
    let line = stdout
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ProviderError::Backend("docker stats returned no data".into()))?;
    let stats: StatsLine = serde_json::from_str(line)?;

    let cpu_percent = stats
        .cpu_perc
        .trim()
        .trim_end_matches('%')
        .parse()
        .unwrap_or(0.0);
    let memory_mb = stats
        .mem_usage
        .split('/')
        .next()
        .and_then(parse_size_mb)
        .unwrap_or(0);

    Ok(ContainerStats {
        cpu_percent,
        memory_mb,
    })
}

/// Parse a Docker size such as `12.5MiB` or `1.2GB` into whole megabytes.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_size_mb(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;

    let factor = match unit.trim() {
        "B" => 1.0 / (1024.0 * 1024.0),
        "KiB" | "kB" | "KB" => 1.0 / 1024.0,
        "MiB" | "MB" | "" => 1.0,
        "GiB" | "GB" => 1024.0,
        "TiB" | "TB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor).round() as u64)
}
