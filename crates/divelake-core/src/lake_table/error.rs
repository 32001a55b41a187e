//! Error types and SNAFU context selectors for `lake_table`.
//!
//! Sibling modules attach context through the `pub(crate)` selectors exported
//! here so user-facing messages stay consistent.

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    storage::StorageError,
    transaction_log::{CommitError, TableKind},
};

/// Errors from physical table operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TableError {
    /// Any error coming from the commit log (conflicts, storage, corruption).
    #[snafu(display("Transaction log error: {source}"))]
    TransactionLog {
        /// Underlying commit error.
        #[snafu(source, backtrace)]
        source: CommitError,
    },

    /// Storage failure outside the commit log (data files).
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(source, backtrace)]
        source: StorageError,
    },

    /// Opening a location that holds no table.
    #[snafu(display("No table exists at {location}"))]
    NotFound {
        /// Table root that was checked.
        location: String,
    },

    /// Creating a table where commits already exist.
    #[snafu(display("Table already exists at {location} (version {current_version})"))]
    AlreadyExists {
        /// Table root.
        location: String,
        /// Current log version.
        current_version: u64,
    },

    /// A batch does not match the fixed schema of the table.
    #[snafu(display("Schema mismatch writing {kind} table: {detail}"))]
    SchemaMismatch {
        /// Target table kind.
        kind: TableKind,
        /// What did not match.
        detail: String,
    },

    /// The table log describes a different table kind than expected.
    #[snafu(display("Table at {location} is a {found} table, expected {expected}"))]
    KindMismatch {
        /// Table root.
        location: String,
        /// Expected kind.
        expected: TableKind,
        /// Kind recorded in the log.
        found: TableKind,
    },

    /// Arrow compute or batch construction failure.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },

    /// Parquet encode or decode failure for a data file.
    #[snafu(display("Parquet error in {path}: {source}"))]
    Parquet {
        /// Table-relative file path.
        path: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },
}

/// Convenience result alias for table operations.
pub type TableResult<T> = Result<T, TableError>;
