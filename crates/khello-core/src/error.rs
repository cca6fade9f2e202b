//! khello error types.

use std::fmt;

use crate::registry::RegistrationStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KhelloError {
    /// Copy to or from caller memory failed, wholly or partway.
    TransferFault { copied: usize, missing: usize },
    /// Page allocation or mapping failed (errno).
    AllocationFault(i32),
    /// Mapping request larger than the mappable page.
    SizeExceeded { requested: usize, limit: usize },
    /// The registration layer refused a stage (errno).
    RegistrationFault { stage: RegistrationStage, errno: i32 },
    /// Page teardown attempted while sessions are still open.
    PageInUse(usize),
    /// Access past the end of the page.
    OutOfRange { offset: usize, len: usize, limit: usize },
    /// Caller passed a value the device cannot act on.
    InvalidArgument(&'static str),
    /// Operation on a session that is no longer mapped.
    SessionClosed,
    /// OS error with errno.
    Os(i32),
}

impl KhelloError {
    /// Negative errno, as the dispatch layer hands it back to callers.
    ///
    /// Never zero: a carried code of 0 (or one that cannot be negated)
    /// reports `EIO`.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::TransferFault { .. } => libc::EFAULT,
            Self::AllocationFault(_) => libc::ENOMEM,
            Self::SizeExceeded { .. } => libc::EINVAL,
            Self::RegistrationFault { errno, .. } => *errno,
            Self::PageInUse(_) => libc::EBUSY,
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::SessionClosed => libc::EBADF,
            Self::Os(e) => *e,
        };
        match code.checked_abs() {
            Some(c) if c > 0 => -c,
            _ => -libc::EIO,
        }
    }
}

impl fmt::Display for KhelloError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransferFault { copied, missing } => {
                write!(f, "transfer fault: copied {} bytes, {} bytes not transferred", copied, missing)
            }
            Self::AllocationFault(e) => write!(f, "page allocation failed: errno {}", e),
            Self::SizeExceeded { requested, limit } => {
                write!(f, "mapping of {} bytes exceeds page size {}", requested, limit)
            }
            Self::RegistrationFault { stage, errno } => {
                write!(f, "registration failed at {}: errno {}", stage, errno)
            }
            Self::PageInUse(n) => write!(f, "page still mapped by {} session(s)", n),
            Self::OutOfRange { offset, len, limit } => {
                write!(f, "access [{}, {}) outside page of {} bytes", offset, offset + len, limit)
            }
            Self::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Self::SessionClosed => write!(f, "mapping session is closed"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for KhelloError {}

pub type Result<T> = std::result::Result<T, KhelloError>;
