//! Session and operation state machines.
//!
//! # Sessions
//!
//! ```text
//!   ┌────────┐  ttl passed / invalidated  ┌─────────┐  reaped / removed  ┌────────┐
//!   │ Active │───────────────────────────▶│ Expired │───────────────────▶│ Closed │
//!   └────────┘                            └─────────┘                    └────────┘
//!       │                                                                    ▲
//!       └─────────────────────── remove / close_all ─────────────────────────┘
//! ```
//!
//! # Operations
//!
//! ```text
//!   ┌────────┐  dequeued  ┌─────────┐  ok   ┌───────────┐
//!   │ Queued │───────────▶│ Running │──────▶│ Succeeded │
//!   └────────┘            └─────────┘       └───────────┘
//!                              │    error   ┌───────────┐
//!                              └───────────▶│  Failed   │
//!                                           └───────────┘
//! ```
//!
//! There is no cancelled state. An operation abandoned at shutdown is `Failed`.

use atlas_console_core::OperationId;

use crate::error::{ControlError, Result};
use crate::operation::OperationStatus;
use crate::session::SessionState;

/// Check if an operation status change is allowed.
#[must_use]
pub const fn is_valid_operation_transition(from: OperationStatus, to: OperationStatus) -> bool {
    use OperationStatus::{Failed, Queued, Running, Succeeded};

    matches!(
        (from, to),
        (Queued, Running) | (Running, Succeeded | Failed)
    )
}

/// Validates an operation status change and returns the target status.
///
/// # Errors
///
/// Returns `ControlError::InvariantViolation` if the transition is not allowed.
pub fn validate_operation_transition(
    id: &OperationId,
    from: OperationStatus,
    to: OperationStatus,
) -> Result<OperationStatus> {
    if is_valid_operation_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvariantViolation(format!(
            "operation {id} cannot move from {from:?} to {to:?}"
        )))
    }
}

/// Check if a session state change is allowed.
#[must_use]
pub const fn is_valid_session_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Active, Closed, Expired};

    matches!((from, to), (Active, Expired | Closed) | (Expired, Closed))
}

/// Returns true once an operation will not change again.
#[must_use]
pub const fn is_terminal(status: OperationStatus) -> bool {
    matches!(status, OperationStatus::Succeeded | OperationStatus::Failed)
}
