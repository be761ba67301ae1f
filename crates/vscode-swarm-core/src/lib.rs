//! Core types for vscode-swarm.
//!
//! This crate provides the identifiers shared by every other crate in the
//! workspace:
//!
//! - [`InstanceId`]: blake3-derived identity of a managed VS Code instance
//! - [`PlanId`]: UUID identity of a migration plan
//!
//! # Example
//!
//! ```
//! use vscode_swarm_core::{InstanceId, PlanId};
//!
//! let instance_id = InstanceId::generate("dev1");
//! let parsed = InstanceId::from_hex(&instance_id.to_hex()).unwrap();
//! assert_eq!(instance_id, parsed);
//!
//! let plan_id = PlanId::generate();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{IdError, InstanceId, PlanId};
