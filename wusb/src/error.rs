use std::result;
use std::sync::PoisonError;

pub type Result<T=()> = result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Input/output error: {0}")]
    Io(String),

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Entity not found")]
    NotFound,

    #[error("Resource busy ")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("Overflow")]
    Overflow,

    #[error("Pipe error")]
    Pipe,

    #[error("Insufficient memory")]
    NoMem,

    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,

    #[error("Cancelled")]
    Cancelled,

    #[error("Identity table is full ({0} entries)")]
    CapacityExhausted(usize),

    #[error("[USB] Something wrong: {0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(value: PoisonError<T>) -> Self {
        Error::Other(format!("lock poisoned: {}", value))
    }
}

/// Failure codes reported by the operating system collaborators.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsError {
    #[error("file not found")]
    FileNotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("device does not recognize the command")]
    BadCommand,
    #[error("no more items")]
    NoMoreItems,
    #[error("already exists")]
    AlreadyExists,
    #[error("overlapped I/O operation is in progress")]
    IoPending,
    #[error("a device attached to the system is not functioning")]
    GenFailure,
    #[error("the semaphore timeout period has expired")]
    SemTimeout,
    #[error("the I/O operation has been aborted")]
    OperationAborted,
    #[error("os error code {0}")]
    Code(u32),
}

impl From<OsError> for Error {
    fn from(value: OsError) -> Self {
        match value {
            OsError::FileNotFound => Error::NoDevice,
            OsError::AccessDenied => Error::Access,
            OsError::BadCommand => Error::NoDevice,
            OsError::NoMoreItems => Error::NotFound,
            OsError::AlreadyExists => Error::Busy,
            other => Error::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_error_translation() {
        assert_eq!(Error::from(OsError::FileNotFound), Error::NoDevice);
        assert_eq!(Error::from(OsError::AccessDenied), Error::Access);
        assert_eq!(Error::from(OsError::AlreadyExists), Error::Busy);
        assert!(matches!(Error::from(OsError::Code(31)), Error::Io(_)));
    }
}
