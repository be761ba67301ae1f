//! Fleet controller for VS Code server instances.
//!
//! This crate owns the registry of instances, routes lifecycle operations to
//! the provider that hosts each instance, watches instance health and moves
//! instances between providers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SwarmController                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │  Instance   │ │   Health    │ │     Migration       │    │
//! │  │  Lifecycle  │ │   Monitor   │ │     Manager         │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Fleet (registry, providers, per-instance locks)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┼──────────────┐
//!               ▼              ▼              ▼
//!        ┌──────────┐   ┌──────────┐   ┌──────────┐
//!        │ Registry │   │  Docker  │   │   K8s    │
//!        │ (RocksDB)│   │ Provider │   │ Provider │
//!        └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use vscode_swarm_control::{ControllerConfig, InstanceConfig, SwarmController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = SwarmController::new(ControllerConfig::from_env());
//! controller.initialize().await?;
//!
//! let config = InstanceConfig::new("dev1", "/home/dev/project");
//! let instance = controller.create_instance(&config, None).await?;
//! println!("Created instance: {}", instance.id);
//!
//! controller.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Lifecycle
//!
//! Instance statuses follow the state machine in [`lifecycle`]. `Failed`
//! and `Deleted` are terminal for an id.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
pub mod fleet;
pub mod health;
pub mod lifecycle;
pub mod locks;
pub mod migration;
pub mod registry;

pub use config::{
    ControllerConfig, GeneralConfig, HealthMonitorConfig, MigrationConfig, RecoveryActionsConfig,
};
pub use controller::SwarmController;
pub use error::{ControlError, ErrorKind, Result};
pub use filter::{InstanceFilter, StatusFilter};
pub use fleet::{Fleet, METADATA_NEEDS_ATTENTION};
pub use health::{
    HealthMonitor, HealthObservation, HealthRecord, HealthStatus, RecoveryOutcome,
    RecoveryStrategy,
};
pub use locks::InstanceLocks;
pub use migration::{
    MigrationManager, MigrationOptions, MigrationPlan, MigrationResult, MigrationStatus,
    MigrationStep, MigrationStrategy, StepKind, StepStatus,
};
pub use registry::InstanceRegistry;

// Re-export commonly used types from dependencies for convenience
pub use vscode_swarm_core::{InstanceId, PlanId};
pub use vscode_swarm_provider::{InstanceUpdate, LogOptions, ProviderConfig};
pub use vscode_swarm_store::{
    InstanceConfig, InstanceStatus, ProviderType, ResourceConfig, VSCodeInstance,
};
