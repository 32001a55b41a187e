//! Error types and SNAFU context selectors for the query engine.
//!
//! [`PondError`] is the single error type returned by [`crate::DivePond`] and
//! [`crate::DatasetManager`]. Lower-level errors (catalog, tables, the
//! analytics session) are wrapped rather than flattened so their own context
//! survives, and [`PondError::kind`] maps every variant onto the small,
//! stable taxonomy callers branch on.

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use divelake_core::{
    catalog::CatalogError, config::ConfigError, lake_table::TableError, storage::StorageError,
    transaction_log::TableKind,
};
use snafu::{Backtrace, prelude::*};

use crate::{cache::CacheError, connection::ConnectionError};

/// Coarse classification of a [`PondError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or ambiguous backend configuration. Fatal at startup.
    Configuration,
    /// The analytics session could not be built or was already closed.
    EngineInit,
    /// The dataset was never initialized.
    DatasetNotFound,
    /// A write payload does not fit the fixed table schema.
    SchemaMismatch,
    /// A malformed request or a failure inside the query engine.
    Query,
    /// A dataset is half-initialized or half-removed and needs an operator.
    DatasetInconsistent,
    /// Lower-level storage, catalog or commit failure.
    Storage,
}

/// Errors returned by the pond.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PondError {
    /// The warehouse configuration could not be resolved.
    #[snafu(display("Configuration error: {source}"))]
    Configuration {
        /// Underlying configuration error.
        #[snafu(backtrace)]
        source: ConfigError,
    },

    /// The analytics session failed to start or is closed.
    #[snafu(display("Engine initialization error: {source}"))]
    EngineInit {
        /// Underlying connection error.
        #[snafu(backtrace)]
        source: ConnectionError,
    },

    /// The dataset has never been initialized.
    #[snafu(display("Dataset {dataset:?} not found; initialize it first"))]
    DatasetNotFound {
        /// Requested dataset name.
        dataset: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A write payload does not match the table schema.
    #[snafu(display("Schema mismatch writing to dataset {dataset:?}: {detail}"))]
    SchemaMismatch {
        /// Target dataset.
        dataset: String,
        /// What did not match.
        detail: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The query engine failed while running a request.
    #[snafu(display("Query failed on {view} [{predicate}]: {source}"))]
    Query {
        /// View the request ran against.
        view: String,
        /// Rendered filter context of the request.
        predicate: String,
        /// Underlying engine error.
        source: DataFusionError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A request was rejected before reaching the engine.
    #[snafu(display("Invalid request [{predicate}]: {reason}"))]
    InvalidRequest {
        /// Rendered filter context of the request.
        predicate: String,
        /// Why it was rejected.
        reason: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A dataset view could not be (re)registered with the session.
    #[snafu(display("Cannot register view {view}: {source}"))]
    View {
        /// View name.
        view: String,
        /// Underlying engine error.
        source: DataFusionError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Arrow failure while reshaping a query result.
    #[snafu(display("Failed to build result for [{predicate}]: {source}"))]
    Reshape {
        /// Rendered filter context of the request.
        predicate: String,
        /// Underlying Arrow error.
        source: ArrowError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A dataset is in a state that needs manual repair.
    #[snafu(display("Dataset {dataset:?} is inconsistent: {reason}"))]
    DatasetInconsistent {
        /// Affected dataset.
        dataset: String,
        /// What is wrong with it.
        reason: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Catalog bookkeeping failed.
    #[snafu(display("Catalog error: {source}"))]
    Catalog {
        /// Underlying catalog error.
        #[snafu(backtrace)]
        source: CatalogError,
    },

    /// A physical table operation failed.
    #[snafu(display("Table error on {dataset}.{kind}: {source}"))]
    Table {
        /// Dataset owning the table.
        dataset: String,
        /// Which table.
        kind: TableKind,
        /// Underlying table error.
        source: TableError,
    },

    /// Warehouse storage failed outside any table.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// An explicit cache maintenance call failed.
    #[snafu(display("Cache maintenance failed: {source}"))]
    Cache {
        /// Underlying cache error.
        #[snafu(backtrace)]
        source: CacheError,
    },
}

impl PondError {
    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PondError::Configuration { .. } => ErrorKind::Configuration,
            PondError::Catalog {
                source: CatalogError::Config { .. },
            } => ErrorKind::Configuration,
            PondError::EngineInit { .. } => ErrorKind::EngineInit,
            PondError::DatasetNotFound { .. } => ErrorKind::DatasetNotFound,
            PondError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            PondError::Table {
                source: TableError::SchemaMismatch { .. },
                ..
            } => ErrorKind::SchemaMismatch,
            PondError::Catalog {
                source: CatalogError::InvalidDatasetName { .. },
            } => ErrorKind::Query,
            PondError::Query { .. }
            | PondError::InvalidRequest { .. }
            | PondError::View { .. }
            | PondError::Reshape { .. } => ErrorKind::Query,
            PondError::DatasetInconsistent { .. } => ErrorKind::DatasetInconsistent,
            PondError::Catalog { .. }
            | PondError::Table { .. }
            | PondError::Storage { .. }
            | PondError::Cache { .. } => ErrorKind::Storage,
        }
    }
}

/// Convenience result alias for pond operations.
pub type PondResult<T> = Result<T, PondError>;
