use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Errors produced by a concrete storage backend.
///
/// Backend-specific failures are wrapped in this enum so higher layers can map
/// them into [`StorageError`] variants with path context attached.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
    /// An error returned by an object store (S3-compatible bucket).
    ObjectStore(object_store::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
            BackendError::ObjectStore(e) => write!(f, "object store error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
            BackendError::ObjectStore(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other backend failure.
    #[snafu(display("Storage I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Classify an object store error into the matching storage variant.
    pub(crate) fn from_object_store(path: String, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                path,
                source: BackendError::ObjectStore(err),
                backtrace: Backtrace::capture(),
            },
            object_store::Error::AlreadyExists { .. } => StorageError::AlreadyExists {
                path,
                source: BackendError::ObjectStore(err),
                backtrace: Backtrace::capture(),
            },
            other => StorageError::OtherIo {
                path,
                source: BackendError::ObjectStore(other),
                backtrace: Backtrace::capture(),
            },
        }
    }

    /// Classify a local I/O error into the matching storage variant.
    pub(crate) fn from_local(path: String, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound {
                path,
                source: BackendError::Local(err),
                backtrace: Backtrace::capture(),
            },
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
                path,
                source: BackendError::Local(err),
                backtrace: Backtrace::capture(),
            },
            _ => StorageError::OtherIo {
                path,
                source: BackendError::Local(err),
                backtrace: Backtrace::capture(),
            },
        }
    }
}
