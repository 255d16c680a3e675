//! Error types for the console runtime.
//!
//! Absence of a session or operation is not an error at the table level: the
//! stores return `Option`/`bool`. `NotFound` exists for the layers above that
//! need to turn an absence into a response.

use atlas_console_core::IdError;
use thiserror::Error;

use crate::operation::OperationKind;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in session and operation management.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Unknown or expired session token, or unknown operation id.
    #[error("not found: {0}")]
    NotFound(String),

    /// The database rejected the supplied credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The database could not be reached.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection string is not a `mongodb://` or `mongodb+srv://` URL.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// A call against the remote control plane failed.
    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(String),

    /// The metadata of a queued operation does not fit its kind.
    #[error("invalid metadata for {kind}: {reason}")]
    InvalidMetadata {
        /// The operation kind being executed.
        kind: OperationKind,
        /// Why the metadata was rejected.
        reason: String,
    },

    /// A programming error, such as restarting a stopped worker.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A malformed identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AuthenticationFailed(_) => 401,
            Self::InvalidConnectionString(_) | Self::InvalidMetadata { .. } | Self::InvalidId(_) => {
                400
            }
            Self::ConnectionFailed(_) => 503,
            Self::RemoteOperationFailed(_) => 502,
            Self::InvariantViolation(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if the caller may resubmit and expect a different outcome.
    ///
    /// Nothing in this crate retries on its own; this only guides the caller.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::RemoteOperationFailed(_) | Self::Internal(_)
        )
    }
}
