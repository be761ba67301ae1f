//! Backend providers for vscode-swarm instances.
//!
//! This crate provides the [`Provider`] trait and its Docker and Kubernetes
//! implementations. A provider turns an
//! [`InstanceConfig`](vscode_swarm_store::InstanceConfig) into a running
//! `code-server` and answers lifecycle, log, exec and health calls for the
//! instances it created.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    SwarmController                        │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ProviderFactory                        │
//! │        ┌────────────────┐     ┌──────────────────┐        │
//! │        │ DockerProvider │     │ KubernetesProvider│       │
//! │        └────────────────┘     └──────────────────┘        │
//! │                │                        │                 │
//! │        ┌───────┴───────┐        ┌───────┴───────┐         │
//! │        │ Shadow store  │        │ Shadow store  │         │
//! │        └───────────────┘        └───────────────┘         │
//! └──────────────────────────────────────────────────────────┘
//!                 │                          │
//!                 ▼                          ▼
//!           docker CLI              Kubernetes API server
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vscode_swarm_provider::{ProviderConfig, ProviderFactory};
//! use vscode_swarm_store::InstanceConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ProviderFactory::with_defaults();
//! let provider = factory.create_provider(&ProviderConfig::new("docker", "local", "eu-west"))?;
//! provider.initialize().await?;
//!
//! let instance = provider
//!     .create_instance(&InstanceConfig::new("dev1", "/home/me/project"))
//!     .await?;
//! println!("{} -> {:?}", instance.id, instance.network.urls);
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature to use [`MockProvider`], which keeps
//! instances in memory and can inject failures and delays per operation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod docker;
pub mod error;
pub mod factory;
pub mod kubernetes;
pub mod logs;
pub mod provider;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use docker::{DockerOptions, DockerProvider};
pub use error::{ProviderError, Result};
pub use factory::{ProviderConstructor, ProviderFactory};
pub use kubernetes::{KubernetesOptions, KubernetesProvider};
pub use provider::{Provider, ProviderBase};
pub use store::{LocalInstanceStore, MemoryInstanceStore};
pub use types::{
    CommandOutput, InstanceUpdate, LogEntry, LogLevel, LogOptions, ProviderCapabilities,
    ProviderConfig, ResourceLimits,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockOp, MockProvider};
