//! Backup coordination error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::{OperationId, OperationKind};

/// Errors returned by coordinator entry points
#[derive(Debug, Error)]
pub enum BackupError {
    /// Another operation is already pending or running
    #[error("Conflict: {active_kind} operation {active} is already in flight")]
    Conflict {
        /// The operation currently holding the coordinator
        active: OperationId,
        /// Its kind
        active_kind: OperationKind,
    },

    /// Operation not known to the coordinator
    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    /// Operation already reached a terminal state
    #[error("Operation is not pending or running: {0}")]
    NotActive(OperationId),

    /// The coordinator went away before the operation finished
    #[error("Operation abandoned before completion: {0}")]
    Abandoned(OperationId),

    /// Requests and attached observers need a Tokio runtime to run on
    #[error("No Tokio runtime available")]
    NoRuntime,
}

impl BackupError {
    /// Classification of this error, if it maps onto an operation error kind
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            BackupError::Conflict { .. } => Some(ErrorKind::Conflict),
            _ => None,
        }
    }
}

/// Failures reported by a [`BackupTransport`](crate::transport::BackupTransport)
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransportError {
    /// Backup store could not be reached
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Backup store failed to read or write
    #[error("Storage error: {0}")]
    Storage(String),

    /// Non-zero status code from an external backup service
    #[error("Transport reported status {0}")]
    Status(i32),

    /// No response within the configured operation timeout
    #[error("Operation timed out")]
    Timeout,

    /// Transport stopped after observing cancellation
    #[error("Transport aborted")]
    Aborted,
}

impl TransportError {
    /// Map a status code from an external backup service.
    ///
    /// Zero means success; any other value is surfaced as [`TransportError::Status`].
    pub fn from_status(code: i32) -> Result<(), TransportError> {
        if code == 0 {
            Ok(())
        } else {
            Err(TransportError::Status(code))
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Storage(err.to_string())
    }
}

/// Restored data could not be integrated locally
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Apply error: {0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    /// Create an apply error from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error classification carried by failed operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Another operation was in flight
    Conflict,
    /// Transport failed, timeouts included
    Transport(TransportError),
}

impl ErrorKind {
    /// Whether the failure was a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ErrorKind::Transport(TransportError::Timeout))
    }

    /// Whether a later retry can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::Conflict => true,
            ErrorKind::Transport(TransportError::Status(code)) => *code > 0,
            ErrorKind::Transport(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_status_is_success() {
        assert_eq!(TransportError::from_status(0), Ok(()));
    }

    #[test]
    fn test_nonzero_status_is_error() {
        assert_eq!(TransportError::from_status(3), Err(TransportError::Status(3)));
        assert_eq!(TransportError::from_status(-1), Err(TransportError::Status(-1)));
    }

    #[test]
    fn test_timeout_is_transport_subtype() {
        let kind = ErrorKind::Transport(TransportError::Timeout);
        assert!(kind.is_timeout());
        assert!(kind.is_retryable());
        assert!(!ErrorKind::Conflict.is_timeout());
    }

    #[test]
    fn test_negative_status_not_retryable() {
        assert!(!ErrorKind::Transport(TransportError::Status(-2)).is_retryable());
        assert!(ErrorKind::Transport(TransportError::Status(7)).is_retryable());
    }

    #[test]
    fn test_conflict_kind() {
        let err = BackupError::Conflict {
            active: OperationId::new(),
            active_kind: OperationKind::Restore,
        };
        assert_eq!(err.kind(), Some(ErrorKind::Conflict));
        assert!(err.to_string().contains("restore"));
        assert_eq!(BackupError::NoRuntime.kind(), None);
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Storage(msg) if msg.contains("denied")));
    }
}
