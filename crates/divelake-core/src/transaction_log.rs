//! Append-only commit log and table state.
//!
//! Every physical table (a dataset's `data` or `events` table) owns a log:
//!
//! ```text
//! <dataset>.db/data/
//!   _lake_log/
//!     CURRENT                  # latest committed version (e.g. "3\n")
//!     0000000001.json          # SetTableInfo (table creation)
//!     0000000002.json          # AddFile x N (append)
//!     0000000003.json          # RemoveFile x M + AddFile x N (overwrite)
//!   data/animal=a1/deployment=d1/class=sensor/label=depth/part-...parquet
//! ```
//!
//! The log is:
//!
//! - **Append-only**: commits never mutate existing files.
//! - **Monotonically versioned**: versions are `u64` values that only
//!   increase, enforced by the create-new commit file guard.
//! - **Snapshot-isolated**: a reader replays commits up to the `CURRENT` it
//!   observed and keeps that [`TableState`] for its whole scan.
//!
//! An overwrite removes every live file and adds the new ones in a single
//! commit, so readers see either the old contents or the new ones, never a mix.
/// Commit actions and the commit envelope.
pub mod actions;
pub mod data_file;
pub mod log_store;
/// Table-level descriptor and table kinds.
pub mod table_info;
pub mod table_state;

pub use actions::{Commit, LogAction};
pub use data_file::DataFile;
pub use log_store::TransactionLogStore;
pub use table_info::{TABLE_FORMAT_VERSION, TableInfo, TableKind};
pub use table_state::TableState;

use snafu::{Backtrace, prelude::*};

use crate::storage::StorageError;

/// Errors raised while reading or writing the commit log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommitError {
    /// Another writer committed first.
    #[snafu(display("Commit conflict: expected version {expected}, but found {found}"))]
    Conflict {
        /// Version the writer based its commit on.
        expected: u64,
        /// Version actually present.
        found: u64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Storage failure while accessing the log.
    #[snafu(display("Storage error while accessing commit log: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The log contents are not a valid history.
    #[snafu(display("Corrupt log state: {msg}"))]
    CorruptState {
        /// Description of the corruption.
        msg: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}
