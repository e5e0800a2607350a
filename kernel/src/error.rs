//! Kernel error types
//!
//! One variant per error kind crossing a subsystem boundary. Recoverable
//! errors surface to user space as `ERROR` in register 0; [`BadAccess`]
//! terminates the offending process; [`Fatal`] halts the machine.
//!
//! [`BadAccess`]: KernelError::BadAccess
//! [`Fatal`]: KernelError::Fatal

use core::fmt;

/// Value deposited in register 0 when a syscall fails recoverably.
pub const ERROR: isize = -1;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// A user argument was null, negative or out of range.
    InvalidArg { what: &'static str },
    /// The frame bitmap is exhausted or a kernel allocation failed.
    NoMemory { what: &'static str },
    /// No lock, condition variable, pipe or child matches the given id.
    NotFound { what: &'static str, id: usize },
    /// A lock operation was attempted by a process that does not hold it.
    NotOwner { id: usize },
    /// A user pointer or buffer range does not lie entirely in region 1,
    /// or crosses an unmapped page.
    BadAccess { addr: usize, len: usize },
    /// The executable file is missing, malformed, or not linked for
    /// region 1.
    NotLoadable,
    /// An I/O error occurred after the target's region 1 was already
    /// wiped; the process cannot continue.
    UnrecoverableLoad,
    /// The process has no parent to consume its exit status.
    Orphan,
    /// An unrecoverable kernel condition; the machine is halted.
    Fatal { reason: &'static str },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg { what } => write!(f, "invalid argument: {}", what),
            Self::NoMemory { what } => write!(f, "out of memory: {}", what),
            Self::NotFound { what, id } => write!(f, "{} {:#x} not found", what, id),
            Self::NotOwner { id } => write!(f, "caller does not own lock {:#x}", id),
            Self::BadAccess { addr, len } => {
                write!(f, "bad user access: {:#x} len {}", addr, len)
            }
            Self::NotLoadable => write!(f, "executable not loadable"),
            Self::UnrecoverableLoad => {
                write!(f, "load failed after address space was wiped")
            }
            Self::Orphan => write!(f, "process has no parent"),
            Self::Fatal { reason } => write!(f, "fatal: {}", reason),
        }
    }
}
