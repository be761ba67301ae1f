//! Instance lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐
//!     │ Creating │────────────────┐
//!     └────┬─────┘                │
//!          │ (ready)              │ (created, not started)
//!          ▼                      ▼
//!     ┌──────────┐  (stop)   ┌──────────┐
//!     │ Running  │──────────▶│ Stopped  │
//!     │          │◀──────────│          │
//!     └────┬─────┘  (start)  └────┬─────┘
//!          │                      │
//!          ├──────────┬───────────┤
//!          ▼          ▼           ▼
//!     ┌──────────┐ (delete) ┌──────────┐
//!     │  Failed  │─────────▶│ Deleted  │
//!     └──────────┘          └──────────┘
//! ```
//!
//! `Failed` and `Deleted` are terminal for an id. Recreating an instance
//! yields a new id. Any status except `Deleted` may be deleted.

use vscode_swarm_core::InstanceId;
use vscode_swarm_store::InstanceStatus;

use crate::error::{ControlError, Result};

/// Validates a status transition and returns the target status if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    instance_id: &InstanceId,
    from: InstanceStatus,
    to: InstanceStatus,
) -> Result<InstanceStatus> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidState {
            instance_id: *instance_id,
            from,
            to,
        })
    }
}

/// Check if a status transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::{Creating, Deleted, Failed, Running, Stopped};

    matches!(
        (from, to),
        (Creating | Stopped, Running)
            | (Creating | Running, Stopped)
            | (Creating | Running | Stopped, Failed)
            | (Creating | Running | Stopped | Failed, Deleted)
    )
}

/// Returns true if the id can never become usable again.
#[must_use]
pub const fn is_terminal(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Failed | InstanceStatus::Deleted)
}

/// Returns true if the health monitor should check the instance.
#[must_use]
pub const fn is_monitored(status: InstanceStatus) -> bool {
    matches!(status, InstanceStatus::Running | InstanceStatus::Creating)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use InstanceStatus::*;

        assert!(is_valid_transition(Creating, Running));
        assert!(is_valid_transition(Creating, Stopped));
        assert!(is_valid_transition(Running, Stopped));
        assert!(is_valid_transition(Stopped, Running));
        assert!(is_valid_transition(Running, Failed));
        assert!(is_valid_transition(Failed, Deleted));
    }

    #[test]
    fn invalid_transitions() {
        use InstanceStatus::*;

        // Terminal states do not come back
        assert!(!is_valid_transition(Failed, Running));
        assert!(!is_valid_transition(Deleted, Running));
        assert!(!is_valid_transition(Deleted, Failed));
        // Nothing returns to Creating
        assert!(!is_valid_transition(Stopped, Creating));
        assert!(!is_valid_transition(Running, Creating));
    }

    #[test]
    fn validate_transition_err() {
        let instance_id = InstanceId::from_bytes([1u8; 32]);
        let result =
            validate_transition(&instance_id, InstanceStatus::Failed, InstanceStatus::Running);

        match result {
            Err(ControlError::InvalidState { from, to, .. }) => {
                assert_eq!(from, InstanceStatus::Failed);
                assert_eq!(to, InstanceStatus::Running);
            }
            _ => panic!("expected InvalidState error"),
        }
    }

    #[test]
    fn monitored_and_terminal() {
        assert!(is_monitored(InstanceStatus::Creating));
        assert!(is_monitored(InstanceStatus::Running));
        assert!(!is_monitored(InstanceStatus::Stopped));
        assert!(is_terminal(InstanceStatus::Failed));
        assert!(!is_terminal(InstanceStatus::Stopped));
    }
}
