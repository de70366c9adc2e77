use thiserror::Error;

use crate::alerts::RetryAction;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid call id: {0}")]
    InvalidCallId(String),
    #[error("session acquisition failed: {0}")]
    SessionAcquisitionFailed(String),
    #[error("call has already ended")]
    CallAlreadyEnded,
    #[error("transport connect failed: {0}")]
    TransportConnectFailed(String),
    #[error("control command failed: {0}")]
    ControlCommandFailed(String),
    #[error("leave notification failed: {0}")]
    TeardownFailure(String),
    /// The join attempt was abandoned before it completed.
    #[error("join cancelled")]
    Cancelled,
}

/// User-facing classification of a [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PermissionDenied,
    SessionAcquisitionFailed,
    CallAlreadyEnded,
    TransportConnectFailed,
    ControlCommandFailed,
    TeardownFailure,
    Cancelled,
}

impl CallError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::PermissionDenied(_) => ErrorClass::PermissionDenied,
            CallError::InvalidCallId(_) | CallError::SessionAcquisitionFailed(_) => {
                ErrorClass::SessionAcquisitionFailed
            }
            CallError::CallAlreadyEnded => ErrorClass::CallAlreadyEnded,
            CallError::TransportConnectFailed(_) => ErrorClass::TransportConnectFailed,
            CallError::ControlCommandFailed(_) => ErrorClass::ControlCommandFailed,
            CallError::TeardownFailure(_) => ErrorClass::TeardownFailure,
            CallError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

impl ErrorClass {
    /// Failures that stop the join pipeline and block the call screen.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            ErrorClass::PermissionDenied
                | ErrorClass::SessionAcquisitionFailed
                | ErrorClass::CallAlreadyEnded
                | ErrorClass::TransportConnectFailed
        )
    }

    pub fn retry_action(self) -> RetryAction {
        match self {
            ErrorClass::PermissionDenied
            | ErrorClass::SessionAcquisitionFailed
            | ErrorClass::TransportConnectFailed => RetryAction::Retry,
            ErrorClass::CallAlreadyEnded => RetryAction::Refresh,
            ErrorClass::ControlCommandFailed
            | ErrorClass::TeardownFailure
            | ErrorClass::Cancelled => RetryAction::None,
        }
    }
}
