//! Error types for the fleet controller.
//!
//! Every error maps onto one of four caller-facing kinds (see [`ErrorKind`]):
//! configuration problems raised before any backend call, backend failures,
//! unknown ids, and timeouts.

use thiserror::Error;
use vscode_swarm_core::{InstanceId, PlanId};
use vscode_swarm_provider::ProviderError;
use vscode_swarm_store::{InstanceStatus, ProviderType};

use crate::migration::MigrationStatus;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Coarse classification of a [`ControlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing fields, capability violations.
    Config,
    /// Backend unreachable or operation rejected.
    Provider,
    /// Unknown instance or plan.
    NotFound,
    /// A provider call exceeded its budget.
    Timeout,
    /// The operation conflicts with the current state.
    Conflict,
    /// Storage or internal failure.
    Internal,
}

/// Errors that can occur in controller operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Invalid request or configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested instance was not found.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// The requested migration plan was not found.
    #[error("migration plan not found: {0}")]
    PlanNotFound(PlanId),

    /// No active provider of this type.
    #[error("provider {0} is not active")]
    ProviderUnavailable(ProviderType),

    /// A provider call did not finish in time.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// The provider operation.
        operation: String,
        /// The budget that was exceeded.
        timeout_ms: u64,
    },

    /// The requested status transition is not valid.
    #[error("invalid status transition for instance {instance_id}: cannot go from {from} to {to}")]
    InvalidState {
        /// The instance being transitioned.
        instance_id: InstanceId,
        /// The current status.
        from: InstanceStatus,
        /// The requested target status.
        to: InstanceStatus,
    },

    /// The migration plan is not in a status that allows the operation.
    #[error("migration plan {plan_id} is {status}")]
    InvalidPlanState {
        /// The plan.
        plan_id: PlanId,
        /// Its current status.
        status: MigrationStatus,
    },

    /// The controller has not been initialized or was disposed.
    #[error("controller is not initialized")]
    NotInitialized,

    /// Error reported by a provider.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] vscode_swarm_store::StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Provider(ProviderError::Config(_)) => ErrorKind::Config,
            Self::InstanceNotFound(_)
            | Self::PlanNotFound(_)
            | Self::Provider(ProviderError::NotFound(_)) => ErrorKind::NotFound,
            Self::Timeout { .. } | Self::Provider(ProviderError::Timeout(_)) => ErrorKind::Timeout,
            Self::InvalidState { .. } | Self::InvalidPlanState { .. } => ErrorKind::Conflict,
            Self::ProviderUnavailable(_) | Self::Provider(_) => ErrorKind::Provider,
            Self::NotInitialized | Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Config => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Timeout => 504,
            ErrorKind::Provider => 502,
            ErrorKind::Internal => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::ProviderUnavailable(_) | Self::Store(_) => true,
            Self::Provider(e) => e.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_kind() {
        let err = ControlError::from(ProviderError::Config("CPU cores exceed maximum".into()));
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.http_status_code(), 400);
        assert!(!err.is_retriable());

        let err = ControlError::from(ProviderError::Backend("daemon down".into()));
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.is_retriable());

        let err = ControlError::from(ProviderError::NotFound("abc".into()));
        assert_eq!(err.http_status_code(), 404);
    }

    #[test]
    fn timeout_is_distinct_and_retriable() {
        let err = ControlError::Timeout {
            operation: "start_instance".into(),
            timeout_ms: 500,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retriable());
        assert_eq!(err.to_string(), "start_instance timed out after 500ms");
    }

    #[test]
    fn error_status_codes() {
        let instance_id = InstanceId::from_bytes([1u8; 32]);
        assert_eq!(ControlError::InstanceNotFound(instance_id).http_status_code(), 404);
        assert_eq!(
            ControlError::InvalidState {
                instance_id,
                from: InstanceStatus::Deleted,
                to: InstanceStatus::Running,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            ControlError::ProviderUnavailable(ProviderType::Docker).http_status_code(),
            502
        );
        assert_eq!(ControlError::NotInitialized.http_status_code(), 500);
    }
}
