//! Error type shared by the descriptor-table engine.
//!
//! Only user-triggerable conditions are representable here. Internal
//! consistency violations (impossible slot states, publishing over an
//! unreserved slot, ...) are panics, not errors: they indicate a concurrency
//! bug and cannot be recovered from.

use core::fmt;

/// Engine error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Descriptor number out of range, unallocated, or mid-reservation
    BadFileDescriptor,
    /// Per-process open file limit reached
    TooManyOpenFiles,
    /// System-wide open file limit reached
    FileTableFull,
    /// Table growth or handle allocation failed
    OutOfMemory,
    /// Guard attribute or security-policy veto
    PermissionDenied,
    /// Operation not implemented by this file type
    NotSupported,
    /// No backing device for read/write
    NoSuchDevice,
    /// Control command not recognized by this file type
    NotATty,
    /// Non-blocking advisory lock request conflicts with an existing lock
    WouldBlock,
    /// Blocking wait was interrupted (descriptor being drained)
    Interrupted,
    /// Malformed request (bad range, unsendable file type, ...)
    InvalidArgument,
    /// Advisory lock wait budget exhausted
    TimedOut,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// BSD errno equivalent, for callers translating to a syscall ABI.
    pub const fn errno(self) -> i32 {
        match self {
            Error::PermissionDenied => 1,   // EPERM
            Error::Interrupted => 4,        // EINTR
            Error::NoSuchDevice => 6,       // ENXIO
            Error::BadFileDescriptor => 9,  // EBADF
            Error::OutOfMemory => 12,       // ENOMEM
            Error::InvalidArgument => 22,   // EINVAL
            Error::FileTableFull => 23,     // ENFILE
            Error::TooManyOpenFiles => 24,  // EMFILE
            Error::NotATty => 25,           // ENOTTY
            Error::WouldBlock => 35,        // EAGAIN
            Error::NotSupported => 45,      // ENOTSUP
            Error::TimedOut => 60,          // ETIMEDOUT
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::BadFileDescriptor => "bad file descriptor",
            Error::TooManyOpenFiles => "too many open files",
            Error::FileTableFull => "file table full",
            Error::OutOfMemory => "out of memory",
            Error::PermissionDenied => "permission denied",
            Error::NotSupported => "operation not supported",
            Error::NoSuchDevice => "no such device",
            Error::NotATty => "inappropriate control operation",
            Error::WouldBlock => "resource temporarily unavailable",
            Error::Interrupted => "interrupted",
            Error::InvalidArgument => "invalid argument",
            Error::TimedOut => "operation timed out",
        };
        f.write_str(msg)
    }
}
