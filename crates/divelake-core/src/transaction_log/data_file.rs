//! Per-file statistics recorded in the log.
//!
//! Every Parquet file added to a table is described by a [`DataFile`]: its
//! table-relative path, the partition values shared by all of its rows, the
//! closed time interval its rows cover, and its row count. Readers use these
//! statistics to prune files without opening them and to answer row-count
//! estimates without scanning.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for one immutable data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// Path relative to the table root, `/`-separated.
    pub path: String,
    /// Partition column values shared by every row in the file.
    #[serde(default)]
    pub partition_values: BTreeMap<String, String>,
    /// Minimum timestamp in the file (inclusive).
    pub ts_min: DateTime<Utc>,
    /// Maximum timestamp in the file (inclusive).
    pub ts_max: DateTime<Utc>,
    /// Number of rows.
    pub row_count: u64,
    /// File size in bytes.
    pub file_size: u64,
}

impl DataFile {
    /// Partition value for `column`, if the file is partitioned on it.
    pub fn partition_value(&self, column: &str) -> Option<&str> {
        self.partition_values.get(column).map(String::as_str)
    }
}
