//! Kernel error types
//!
//! Every fallible kernel operation reports one of these values; system
//! calls deliver them to user mode as the negated discriminant in the
//! result register. The discriminants are part of the user ABI and must
//! not be renumbered.

use core::fmt;

/// Kernel operation result type
pub type Result<T> = core::result::Result<T, KernelError>;

/// Kernel error codes
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Unspecified or unknown problem
    Unspecified = 1,
    /// Environment doesn't exist or otherwise cannot be used
    BadEnv = 2,
    /// Invalid parameter
    Inval = 3,
    /// Request failed due to memory shortage
    NoMem = 4,
    /// Attempt to create a new environment beyond the maximum allowed
    NoFreeEnv = 5,
    /// Memory fault inside kernel
    Fault = 6,
    /// Attempt to send to env that is not receiving
    IpcNotRecv = 7,
    /// Invalid system call number
    NoSys = 9,
}

impl KernelError {
    /// Get a static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified error",
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Fault => "segmentation fault",
            Self::IpcNotRecv => "env is not recving",
            Self::NoSys => "no such system call",
        }
    }

    /// Convert to the negative integer delivered in the syscall result
    /// register.
    pub fn to_errno(self) -> i32 {
        -(self as i32)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_stable() {
        assert_eq!(KernelError::BadEnv.to_errno(), -2);
        assert_eq!(KernelError::Inval.to_errno(), -3);
        assert_eq!(KernelError::NoMem.to_errno(), -4);
        assert_eq!(KernelError::NoFreeEnv.to_errno(), -5);
        assert_eq!(KernelError::IpcNotRecv.to_errno(), -7);
        assert_eq!(KernelError::NoSys.to_errno(), -9);
    }
}
