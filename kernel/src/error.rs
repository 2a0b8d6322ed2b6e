//! Error kinds shared by the scheduler, synchronization and signal code.
//!
//! Everything here is recoverable and travels back to the immediate caller;
//! the syscall layer turns it into a POSIX errno. Sigreturn forgery and
//! scheduler invariant violations are not represented here: the former
//! terminates the offending process and the latter panics.

use core::fmt;

use crate::syscall::errno;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad signal number, unknown flag or malformed request
    InvalidArgument,
    /// No process (or thread) matches the given id
    NoSuchProcess,
    /// The signal is already pending; nothing to do
    Duplicate,
    /// A blocking operation was aborted because a signal became deliverable
    Interrupted,
    /// The target process has no thread to route a signal to
    NoThreads,
    /// User memory could not be read or written
    Fault,
    /// The operation is not allowed in the current state
    PermissionDenied,
    /// A caller-supplied buffer is too small
    NoMemory,
}

impl Error {
    /// Translate into the errno value presented to user space.
    ///
    /// `Duplicate` is advisory and never reaches user space; it maps to 0.
    pub const fn to_errno(self) -> i32 {
        match self {
            Error::InvalidArgument => errno::EINVAL,
            Error::NoSuchProcess => errno::ESRCH,
            Error::Duplicate => 0,
            Error::Interrupted => errno::EINTR,
            Error::NoThreads => errno::ESRCH,
            Error::Fault => errno::EFAULT,
            Error::PermissionDenied => errno::EPERM,
            Error::NoMemory => errno::ENOMEM,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NoSuchProcess => "no such process",
            Error::Duplicate => "signal already pending",
            Error::Interrupted => "interrupted by signal",
            Error::NoThreads => "process has no threads",
            Error::Fault => "bad user address",
            Error::PermissionDenied => "operation not permitted",
            Error::NoMemory => "not enough memory",
        };
        f.write_str(text)
    }
}
