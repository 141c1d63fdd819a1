//! Error kinds surfaced by the virtual memory manager.

use core::fmt;

/// Errors that can occur while manipulating address spaces, sections and paging state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmError {
    /// Out of physical frames, descriptors, page file space or pool.
    ResourceExhausted,
    /// No backing, no descriptor or no section for an address.
    NotFound,
    /// The target section was destroyed while the operation was in flight.
    TooLate,
    /// The section no longer covers the address, or a stale page was observed.
    TryAgain,
    /// Alignment, direction or range overflow problem with the arguments.
    InvalidParameter,
    /// A user address could not be accessed.
    AccessViolation,
    /// The resource is pinned or otherwise busy.
    InUse,
    /// The backing device reported an I/O failure.
    DeviceIo,
    /// The requested operation is not supported by the collaborator.
    NotSupported,
    /// The handle does not grant the requested access.
    AccessDenied,
    /// A read started at or beyond the end of the file.
    EndOfFile,
    /// The range does not fall in the valid user address range.
    InvalidAddressRange,
}

/// Result type used throughout the crate.
pub type MmResult<T> = Result<T, MmError>;

impl MmError {
    /// Returns the negative status code handed back to user mode for this error.
    pub const fn status_code(self) -> isize {
        match self {
            Self::ResourceExhausted => -1,
            Self::NotFound => -2,
            Self::TooLate => -3,
            Self::TryAgain => -4,
            Self::InvalidParameter => -5,
            Self::AccessViolation => -6,
            Self::InUse => -7,
            Self::DeviceIo => -8,
            Self::NotSupported => -9,
            Self::AccessDenied => -10,
            Self::EndOfFile => -11,
            Self::InvalidAddressRange => -12,
        }
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ResourceExhausted => "insufficient resources",
            Self::NotFound => "not found",
            Self::TooLate => "section destroyed",
            Self::TryAgain => "try again",
            Self::InvalidParameter => "invalid parameter",
            Self::AccessViolation => "access violation",
            Self::InUse => "resource in use",
            Self::DeviceIo => "device i/o error",
            Self::NotSupported => "not supported",
            Self::AccessDenied => "access denied",
            Self::EndOfFile => "end of file",
            Self::InvalidAddressRange => "invalid address range",
        };

        f.write_str(text)
    }
}

/// Converts a result into the status word returned by a system call.
pub fn status_of<T>(result: &MmResult<T>) -> isize {
    match result {
        Ok(_) => 0,
        Err(error) => error.status_code(),
    }
}
