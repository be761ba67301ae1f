//! Execution of `docker` CLI commands.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::types::CommandOutput;
use crate::{ProviderError, Result};

/// Runs commands against the Docker engine.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `docker <args>` and capture its output. A non-zero exit is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if the process cannot be spawned.
    async fn run(&self, args: &[String]) -> Result<CommandOutput>;

    /// Check that the Docker daemon answers.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if the daemon is unreachable.
    async fn check_available(&self) -> Result<()> {
        self.run(&args(&["version", "--format", "{{.Server.Version}}"]))
            .await?
            .into_result("docker version")
            .map(|_| ())
            .map_err(|e| ProviderError::Backend(format!("Docker is not available: {e}")))
    }

    /// Whether a network with this name exists.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if the command cannot be run.
    async fn network_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .run(&args(&["network", "inspect", name]))
            .await?
            .success())
    }

    /// Create a bridge network.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Backend` if creation fails.
    async fn create_network(&self, name: &str) -> Result<()> {
        self.run(&args(&["network", "create", "--driver", "bridge", name]))
            .await?
            .into_result("docker network create")
            .map(|_| ())
    }
}

/// Build an owned argument vector.
pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// [`CommandExecutor`] backed by the local `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Use the given `docker` binary.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for DockerCli {
    async fn run(&self, args: &[String]) -> Result<CommandOutput> {
        debug!(binary = %self.binary, args = ?args, "Running docker command");

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Backend(format!("failed to run {}: {e}", self.binary)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
