//! Driver error types.

use std::io;

use strata_freelist::FreeListError;
use strum::Display;
use thiserror::Error;

/// The OS-level operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum IoOp {
    Read,
    Write,
    Seek,
    Stat,
    Truncate,
}

/// Errors returned by file drivers.
#[derive(Debug, Error)]
pub enum VfdError {
    /// Invalid argument or configuration value.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Address range outside the file or malformed.
    #[error("bad range: {0}")]
    BadRange(String),

    /// Address arithmetic overflowed.
    #[error("address overflow: {0}")]
    Overflow(String),

    /// File exists and exclusive creation was requested.
    #[error("file already exists: {0}")]
    FileExists(String),

    /// OS refused to open or create the file.
    #[error("unable to open file: name = '{name}', flags = {flags}: {source}")]
    CantOpenFile {
        name: String,
        flags: String,
        #[source]
        source: io::Error,
    },

    /// Driver used after close.
    #[error("file is not open")]
    NotOpen,

    /// OS-level read, write, seek, stat or truncate failed.
    #[error("file {op} failed: {detail}: {source}")]
    Io {
        op: IoOp,
        detail: String,
        #[source]
        source: io::Error,
    },

    /// Buffer allocation failed.
    #[error("memory allocation failed: {0}")]
    CantAlloc(String),

    /// Advisory file lock could not be taken.
    #[error("unable to lock file '{name}': {source}")]
    CantLock {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Advisory file lock could not be released.
    #[error("unable to unlock file '{name}': {source}")]
    CantUnlock {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Internal bookkeeping disagrees with itself.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// Free-list pool failure other than allocation.
    #[error("resource error: {0}")]
    Resource(#[source] FreeListError),
}

impl VfdError {
    pub fn bad_value(msg: impl Into<String>) -> Self {
        Self::BadValue(msg.into())
    }

    pub fn bad_range(msg: impl Into<String>) -> Self {
        Self::BadRange(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }

    pub fn io(op: IoOp, detail: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            op,
            detail: detail.into(),
            source,
        }
    }

    /// The OS errno behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::CantOpenFile { source, .. }
            | Self::Io { source, .. }
            | Self::CantLock { source, .. }
            | Self::CantUnlock { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<FreeListError> for VfdError {
    fn from(e: FreeListError) -> Self {
        match e {
            FreeListError::CantAlloc { size } => {
                Self::CantAlloc(format!("{size} bytes requested"))
            }
            other => Self::Resource(other),
        }
    }
}

impl From<VfdError> for io::Error {
    fn from(e: VfdError) -> Self {
        let kind = match &e {
            VfdError::BadValue(_) | VfdError::BadRange(_) => io::ErrorKind::InvalidInput,
            VfdError::Overflow(_) => io::ErrorKind::InvalidInput,
            VfdError::FileExists(_) => io::ErrorKind::AlreadyExists,
            VfdError::CantOpenFile { source, .. } | VfdError::Io { source, .. } => source.kind(),
            VfdError::NotOpen => io::ErrorKind::NotConnected,
            VfdError::CantAlloc(_) => io::ErrorKind::OutOfMemory,
            VfdError::CantLock { .. } | VfdError::CantUnlock { .. } => io::ErrorKind::WouldBlock,
            VfdError::Consistency(_) => io::ErrorKind::InvalidData,
            VfdError::Resource(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

/// Result type for driver operations.
pub type VfdResult<T> = Result<T, VfdError>;
