//! Core identifier types for vscode-swarm.
//!
//! This module provides strongly-typed identifiers for instances and migration plans.
//! All IDs are designed for efficient storage and lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of hex characters used by [`InstanceId::short_hex`].
pub const SHORT_HEX_LEN: usize = 16;

/// A 32-byte instance identifier, generated via blake3 hash.
///
/// Instance IDs are derived from the instance name, a timestamp and a random
/// salt so that recreating an instance under the same name always yields a
/// fresh identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId([u8; 32]);

impl InstanceId {
    /// Create a new `InstanceId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new unique `InstanceId` using blake3.
    #[must_use]
    pub fn generate(name: &str) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&timestamp.to_le_bytes());
        hasher.update(uuid::Uuid::new_v4().as_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    /// Generate a deterministic `InstanceId` for testing.
    #[must_use]
    pub fn generate_deterministic(name: &str, seed: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(&seed.to_le_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    /// Parse an `InstanceId` from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 64 characters.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 32,
            got: s.len() / 2,
        })?;
        Ok(Self(arr))
    }

    /// Return the underlying bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Return the hex-encoded string representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the first 16 hex characters, used for backend resource names.
    #[must_use]
    pub fn short_hex(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(SHORT_HEX_LEN);
        hex
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.to_hex())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for InstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_hex()
    }
}

impl AsRef<[u8]> for InstanceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 16-byte migration plan identifier based on UUID v4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlanId(uuid::Uuid);

impl PlanId {
    /// Create a new `PlanId` from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a new random `PlanId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl FromStr for PlanId {
    type Err = IdError;

    /// Parse a `PlanId` from a UUID string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

impl fmt::Debug for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlanId({})", self.0)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PlanId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PlanId> for String {
    fn from(id: PlanId) -> Self {
        id.0.to_string()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_hex_roundtrip() {
        let id = InstanceId::generate_deterministic("dev1", 7);
        let parsed = InstanceId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn instance_id_invalid_hex() {
        let result = InstanceId::from_hex("not-valid-hex");
        assert!(matches!(result, Err(IdError::InvalidHex)));
    }

    #[test]
    fn instance_id_wrong_length() {
        let result = InstanceId::from_hex("deadbeef");
        assert!(matches!(result, Err(IdError::InvalidLength { .. })));
    }

    #[test]
    fn instance_id_deterministic() {
        let id1 = InstanceId::generate_deterministic("dev1", 123);
        let id2 = InstanceId::generate_deterministic("dev1", 123);
        assert_eq!(id1, id2);

        let id3 = InstanceId::generate_deterministic("dev1", 456);
        assert_ne!(id1, id3);
    }

    #[test]
    fn instance_id_unique_for_same_name() {
        let id1 = InstanceId::generate("dev1");
        let id2 = InstanceId::generate("dev1");
        assert_ne!(id1, id2);
    }

    #[test]
    fn short_hex_is_prefix() {
        let id = InstanceId::from_bytes([0xab; 32]);
        assert_eq!(id.short_hex().len(), SHORT_HEX_LEN);
        assert!(id.to_hex().starts_with(&id.short_hex()));
    }

    #[test]
    fn instance_id_serde_json() {
        let id = InstanceId::generate_deterministic("dev1", 42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let parsed: InstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn plan_id_parse() {
        let id = PlanId::generate();
        let parsed = PlanId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(matches!(
            PlanId::from_str("not-a-uuid"),
            Err(IdError::InvalidUuid)
        ));
    }
}
