use thiserror::Error;

use crate::incus::IncusError;

/// Daemon-level error taxonomy surfaced to D-Bus callers.
#[derive(Error, Debug)]
pub enum KapsuleError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Container is running: {0}")]
    ContainerRunning(String),

    #[error("Container {name} is in state {status} which does not allow this")]
    ContainerInvalidState { name: String, status: String },

    #[error("Backend error: {0}")]
    Backend(#[from] IncusError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown caller: {0}")]
    UnknownCaller(String),

    #[error("Caller process {0} is gone")]
    CallerGone(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation cancelled; cleanup failed: {0}")]
    CancelledCleanupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KapsuleError {
    /// True when the error describes a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            KapsuleError::Cancelled
                | KapsuleError::CancelledCleanupFailed(_)
                | KapsuleError::Backend(IncusError::Cancelled)
        )
    }
}

/// Errors raised into D-Bus method replies by the synchronous facade methods.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.frostyard.Kapsule.Error")]
pub enum DbusError {
    #[zbus(error)]
    ZBus(zbus::Error),
    ContainerNotFound(String),
    ContainerAlreadyExists(String),
    ContainerRunning(String),
    ContainerInvalidState(String),
    BackendError(String),
    BackendUnavailable(String),
    Timeout(String),
    UnknownCaller(String),
    CallerGone(String),
    InvalidArgument(String),
    Cancelled(String),
    Internal(String),
}

impl From<KapsuleError> for DbusError {
    fn from(err: KapsuleError) -> Self {
        let message = err.to_string();
        match err {
            KapsuleError::ContainerNotFound(_) => DbusError::ContainerNotFound(message),
            KapsuleError::ContainerAlreadyExists(_) => DbusError::ContainerAlreadyExists(message),
            KapsuleError::ContainerRunning(_) => DbusError::ContainerRunning(message),
            KapsuleError::ContainerInvalidState { .. } => DbusError::ContainerInvalidState(message),
            KapsuleError::Backend(ref e) if e.is_unavailable() => {
                DbusError::BackendUnavailable(message)
            }
            KapsuleError::Backend(IncusError::Cancelled) => DbusError::Cancelled(message),
            KapsuleError::Backend(IncusError::Timeout) => DbusError::Timeout(message),
            KapsuleError::Backend(_) => DbusError::BackendError(message),
            KapsuleError::Timeout(_) => DbusError::Timeout(message),
            KapsuleError::UnknownCaller(_) => DbusError::UnknownCaller(message),
            KapsuleError::CallerGone(_) => DbusError::CallerGone(message),
            KapsuleError::InvalidArgument(_) => DbusError::InvalidArgument(message),
            KapsuleError::Cancelled | KapsuleError::CancelledCleanupFailed(_) => {
                DbusError::Cancelled(message)
            }
            KapsuleError::Internal(_) => DbusError::Internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, KapsuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let err = KapsuleError::ContainerNotFound("box".into());
        assert!(matches!(
            DbusError::from(err),
            DbusError::ContainerNotFound(_)
        ));

        let err = KapsuleError::Backend(IncusError::Api {
            status: 500,
            message: "boom".into(),
        });
        assert!(matches!(DbusError::from(err), DbusError::BackendError(_)));
    }

    #[test]
    fn test_unavailable_backend_maps_to_unavailable() {
        let err = KapsuleError::Backend(IncusError::RetryExhausted("socket closed".into()));
        assert!(matches!(
            DbusError::from(err),
            DbusError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_cancelled_detection() {
        assert!(KapsuleError::Cancelled.is_cancelled());
        assert!(KapsuleError::Backend(IncusError::Cancelled).is_cancelled());
        assert!(!KapsuleError::Internal("x".into()).is_cancelled());
    }
}
