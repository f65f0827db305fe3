use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Dirlog errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The write buffers are full and the writer is configured not to
    /// block. The operation may be retried once a compaction drains an
    /// immutable buffer.
    BufferFull,
    /// On-disk data failed validation: a bad checksum, a truncated
    /// read, a malformed handle, or an unexpected footer.
    Corruption(String),
    /// An IO error from a log sink or source.
    IO(String),
    /// An internal limit or ordering contract was violated, e.g. too
    /// many epochs or a write after close.
    AssertionFailed(String),
    /// The requested operation is not available on this object.
    NotSupported(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BufferFull => write!(f, "write buffer full"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::AssertionFailed(msg) => write!(f, "assertion failed: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::AssertionFailed for the given format string.
#[macro_export]
macro_rules! assertion_failed {
    ($($args:tt)*) => { $crate::error::Error::AssertionFailed(format!($($args)*)).into() };
}

/// A dirlog Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
