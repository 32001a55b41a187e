use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction_log::{DataFile, TableInfo};

/// A single action recorded in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogAction {
    /// Register a new data file in the table.
    AddFile(DataFile),
    /// Logically remove a data file (the bytes may still be on storage).
    RemoveFile {
        /// Table-relative path of the removed file.
        path: String,
    },
    /// Replace the table-level descriptor.
    SetTableInfo(TableInfo),
}

/// One version of the table log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Version created by this commit.
    pub version: u64,
    /// Version the writer observed when it planned the commit.
    pub base_version: u64,
    /// Wall-clock time of the commit.
    pub timestamp: DateTime<Utc>,
    /// Actions applied in order.
    pub actions: Vec<LogAction>,
}
