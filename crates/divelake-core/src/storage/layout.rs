//! On-disk layout helpers for a warehouse root.
//!
//! This module centralizes all *relative* path conventions:
//! - dataset directories (`<dataset>.db/`)
//! - table roots inside a dataset (`<dataset>.db/data/`, `<dataset>.db/events/`)
//! - transaction log directory / commit file naming (`_lake_log/`)
//! - hive-style partition directories for data files (`data/animal=a1/...`)
//!
//! The functions here return relative [`std::path::PathBuf`] values. Callers are
//! expected to join these with a [`crate::storage::StorageLocation`] before doing IO.

use std::path::PathBuf;

// ====================
// Warehouse layout
// ====================

/// Suffix of a dataset directory under the warehouse root.
pub const DATASET_DIR_SUFFIX: &str = ".db";

/// Relative path: `<dataset>.db/`
pub fn dataset_rel_dir(dataset: &str) -> PathBuf {
    PathBuf::from(format!("{dataset}{DATASET_DIR_SUFFIX}"))
}

/// Relative path: `<dataset>.db/<table>/`
pub fn table_rel_dir(dataset: &str, table: &str) -> PathBuf {
    dataset_rel_dir(dataset).join(table)
}

/// Recover a dataset name from a directory name like `penguins.db`.
pub fn dataset_name_from_dir(dir_name: &str) -> Option<&str> {
    dir_name
        .strip_suffix(DATASET_DIR_SUFFIX)
        .filter(|name| !name.is_empty())
}

// ====================
// Data layout
// ====================

/// Directory under a table root where Parquet data files are stored.
pub const DATA_DIR_NAME: &str = "data";

/// Relative path: `data/`
pub fn data_rel_dir() -> PathBuf {
    PathBuf::from(DATA_DIR_NAME)
}

/// Relative path of one data file:
/// `data/<col>=<value>/.../part-<version>-<seq>.parquet`.
pub fn data_file_rel_path(partitions: &[(&str, &str)], version: u64, seq: usize) -> PathBuf {
    let mut path = data_rel_dir();
    for (column, value) in partitions {
        path.push(format!("{column}={}", escape_partition_value(value)));
    }
    path.push(format!(
        "part-{:0width$}-{seq:04}.parquet",
        version,
        width = COMMIT_FILENAME_DIGITS
    ));
    path
}

/// Escape a partition value so it is safe as a single path component.
///
/// `/`, `\`, `=`, `%`, `:` and control characters are percent-encoded. The
/// empty string is encoded as `%00` so the component is never empty.
pub fn escape_partition_value(value: &str) -> String {
    if value.is_empty() {
        return "%00".to_string();
    }

    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '/' | '\\' | '=' | '%' | ':' => out.push_str(&format!("%{:02X}", ch as u32)),
            c if c.is_control() && (c as u32) < 0x100 => {
                out.push_str(&format!("%{:02X}", c as u32))
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_partition_value`]. Returns `None` on malformed escapes.
pub fn unescape_partition_value(escaped: &str) -> Option<String> {
    if escaped == "%00" {
        return Some(String::new());
    }

    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ====================
// Transaction log layout
// ====================

/// Name of the subdirectory containing the commit log.
pub const LOG_DIR_NAME: &str = "_lake_log";

/// Name of the file that stores the current version pointer.
pub const CURRENT_FILE_NAME: &str = "CURRENT";

/// Number of digits used in zero-padded commit file names.
pub const COMMIT_FILENAME_DIGITS: usize = 10;

/// Relative path: `_lake_log/`
pub fn log_rel_dir() -> PathBuf {
    PathBuf::from(LOG_DIR_NAME)
}

/// Relative path: `_lake_log/CURRENT`
pub fn current_rel_path() -> PathBuf {
    log_rel_dir().join(CURRENT_FILE_NAME)
}

/// Relative path: `_lake_log/<zero-padded>.json`
pub fn commit_rel_path(version: u64) -> PathBuf {
    let file_name = format!("{:0width$}.json", version, width = COMMIT_FILENAME_DIGITS);
    log_rel_dir().join(file_name)
}
