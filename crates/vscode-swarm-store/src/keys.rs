//! Key encoding for the instance column family.

use vscode_swarm_core::InstanceId;

/// Encode an instance key (just the instance ID bytes).
#[must_use]
pub fn instance_key(instance_id: &InstanceId) -> Vec<u8> {
    instance_id.as_bytes().to_vec()
}
