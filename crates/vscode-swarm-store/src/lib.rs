//! `RocksDB` storage layer for vscode-swarm.
//!
//! This crate provides the persisted instance records and the durable state
//! store backing the instance registry.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `instances`: Primary instance records, keyed by `instance_id`
//!
//! # Example
//!
//! ```no_run
//! use vscode_swarm_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/vscode-swarm-state").unwrap();
//! let instances = store.list_instances().unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AuthConfig, AuthType, CpuConfig, InstanceConfig, InstanceNetwork, InstanceResources,
    InstanceStatus, MemoryConfig, NetworkConfig, PortMapping, ProviderType, ResourceConfig,
    ResourceUsage, StorageConfig, UnknownProviderType, VSCodeInstance, METADATA_ERROR,
};

use vscode_swarm_core::InstanceId;

/// The storage trait for instance records.
///
/// This trait abstracts the storage layer so the registry can be handed any
/// durable backend as `Arc<dyn Store>`.
pub trait Store: Send + Sync {
    /// Insert or update an instance record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_instance(&self, instance: &VSCodeInstance) -> Result<()>;

    /// Get an instance by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_instance(&self, instance_id: &InstanceId) -> Result<Option<VSCodeInstance>>;

    /// Delete an instance by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the instance doesn't exist.
    fn delete_instance(&self, instance_id: &InstanceId) -> Result<()>;

    /// List every stored instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_instances(&self) -> Result<Vec<VSCodeInstance>>;

    /// Flush buffered writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn flush(&self) -> Result<()>;
}
