//! Error types for the gadget engine

use crate::session::SessionState;
use protocol::ProtocolError;
use thiserror::Error;

/// Failure reported by a hardware endpoint or controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HwError {
    /// Endpoint was disabled with the request outstanding
    #[error("Endpoint shut down")]
    Shutdown,

    /// Request was dequeued before it completed
    #[error("Request cancelled")]
    Cancelled,

    #[error("Endpoint stalled")]
    Stalled,

    #[error("Endpoint is not enabled")]
    NotEnabled,

    #[error("Request is not queued on this endpoint")]
    NotQueued,

    #[error("Controller resources exhausted")]
    NoResources,

    #[error("Operation not supported by the controller")]
    Unsupported,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Controller I/O error {0}")]
    Io(i32),
}

/// Errors surfaced by control and endpoint channel operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FfsError {
    /// Upload rejected; no state was retained
    #[error("Malformed upload: {0}")]
    MalformedInput(#[from] ProtocolError),

    #[error("Operation not valid while {0:?}")]
    InvalidState(SessionState),

    /// Handle already open or lock contended in non-blocking mode
    #[error("Resource busy")]
    Busy,

    /// Non-blocking call found nothing ready
    #[error("Operation would block")]
    WouldBlock,

    /// Control request superseded by a newer one
    #[error("Control request withdrawn")]
    Withdrawn,

    #[error("Transfer cancelled")]
    Cancelled,

    /// Endpoint disabled, never bound, or session torn down
    #[error("Device gone")]
    DeviceGone,

    #[error("Overflow: received {received} bytes into a {capacity} byte buffer")]
    Overflow { received: usize, capacity: usize },

    #[error("Out of resources")]
    OutOfResources,

    #[error("Interrupted")]
    Interrupted,

    /// Control request direction mismatch, ep0 stalled
    #[error("Control request stalled")]
    Stalled,

    /// Endpoint direction mismatch, endpoint halted
    #[error("Endpoint halted")]
    Halted,

    #[error("No control request pending")]
    NoPendingRequest,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Not supported")]
    NotSupported,

    #[error("Number out of range")]
    OutOfRange,

    #[error("Hardware error: {0}")]
    Hardware(HwError),
}

impl FfsError {
    /// Conditions a caller is expected to retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FfsError::Busy | FfsError::WouldBlock | FfsError::Withdrawn | FfsError::Interrupted
        )
    }
}

impl From<HwError> for FfsError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::Cancelled => FfsError::Cancelled,
            HwError::Shutdown => FfsError::DeviceGone,
            HwError::NoResources => FfsError::OutOfResources,
            other => FfsError::Hardware(other),
        }
    }
}

/// Result type for gadget operations
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FfsError::Busy.is_retryable());
        assert!(FfsError::Withdrawn.is_retryable());
        assert!(FfsError::Interrupted.is_retryable());
        assert!(!FfsError::DeviceGone.is_retryable());
        assert!(!FfsError::InvalidState(SessionState::Closing).is_retryable());
    }

    #[test]
    fn test_hardware_mapping() {
        assert_eq!(FfsError::from(HwError::Cancelled), FfsError::Cancelled);
        assert_eq!(FfsError::from(HwError::Shutdown), FfsError::DeviceGone);
        assert_eq!(
            FfsError::from(HwError::Stalled),
            FfsError::Hardware(HwError::Stalled)
        );
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: FfsError = ProtocolError::NoDescriptors.into();
        assert!(matches!(err, FfsError::MalformedInput(_)));
        assert!(err.to_string().contains("no descriptors"));
    }
}
