//! Error types for the weft fiber runtime

use core::fmt;

/// Result type for fiber operations
pub type FiberResult<T> = Result<T, FiberError>;

/// Errors that can occur in fiber operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// The operation would deadlock the calling fiber
    /// (joining itself, re-locking a mutex it already owns)
    DeadlockWouldOccur,

    /// The target fiber is not joinable (already joined or detached)
    InvalidArgument,

    /// A `try_*` operation could not complete without suspending
    WouldBlock,

    /// Stack allocation failed
    StackError(StackError),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::DeadlockWouldOccur => write!(f, "operation would deadlock"),
            FiberError::InvalidArgument => write!(f, "fiber not joinable"),
            FiberError::WouldBlock => write!(f, "operation would block"),
            FiberError::StackError(e) => write!(f, "stack error: {}", e),
        }
    }
}

impl std::error::Error for FiberError {}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed to reserve the stack region
    AllocationFailed,

    /// mprotect failed while setting up the guard page
    ProtectionFailed,

    /// Requested stack size is below the supported minimum
    SizeTooSmall,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::SizeTooSmall => write!(f, "requested stack size too small"),
        }
    }
}

impl From<StackError> for FiberError {
    fn from(e: StackError) -> Self {
        FiberError::StackError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FiberError::DeadlockWouldOccur;
        assert_eq!(format!("{}", e), "operation would deadlock");

        let e = FiberError::StackError(StackError::AllocationFailed);
        assert_eq!(format!("{}", e), "stack error: stack allocation failed");
    }

    #[test]
    fn test_error_conversion() {
        let stack_err = StackError::SizeTooSmall;
        let fiber_err: FiberError = stack_err.into();
        assert!(matches!(
            fiber_err,
            FiberError::StackError(StackError::SizeTooSmall)
        ));
    }
}
