//! Reconstructing the current table state by replaying log commits.
//!
//! [`TransactionLogStore::rebuild_table_state`] walks all commits from version
//! 1 up to the `CURRENT` pointer, applying their actions in order. A
//! [`TableState`] is therefore a snapshot: it never changes after it is built,
//! and readers holding one are isolated from commits made afterwards.
use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::transaction_log::{
    CommitError, CorruptStateSnafu, DataFile, LogAction, TableInfo, TransactionLogStore,
};

/// In-memory snapshot of table metadata and live data files.
///
/// Invariant: `info` and `files` are the result of applying all commits from
/// version 1 through `version` in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableState {
    /// Committed version this snapshot reflects.
    pub version: u64,
    /// Table-level descriptor.
    pub info: TableInfo,
    /// Live data files keyed by table-relative path.
    pub files: BTreeMap<String, DataFile>,
}

impl TableState {
    /// Sum of the row-count statistics of all live files.
    pub fn total_rows(&self) -> u64 {
        self.files.values().map(|f| f.row_count).sum()
    }

    /// Live files in path order.
    pub fn data_files(&self) -> impl Iterator<Item = &DataFile> {
        self.files.values()
    }
}

impl TransactionLogStore {
    /// Rebuild the current [`TableState`] by replaying all commits up to CURRENT.
    ///
    /// - If CURRENT == 0 (no commits), this returns `CommitError::CorruptState`.
    /// - The first commit must carry a `SetTableInfo` action; the last one wins.
    pub async fn rebuild_table_state(&self) -> Result<TableState, CommitError> {
        let current_version = self.load_current_version().await?;

        if current_version == 0 {
            return CorruptStateSnafu {
                msg: "Cannot rebuild TableState: CURRENT is 0 (no commits)".to_string(),
            }
            .fail();
        }

        let mut info: Option<TableInfo> = None;
        let mut files: BTreeMap<String, DataFile> = BTreeMap::new();

        for v in 1..=current_version {
            let commit = self.load_commit(v).await?;

            if commit.version != v {
                return CorruptStateSnafu {
                    msg: format!(
                        "Commit version mismatch: expected {v}, found {} in payload",
                        commit.version
                    ),
                }
                .fail();
            }

            for action in commit.actions {
                match action {
                    LogAction::AddFile(file) => {
                        files.insert(file.path.clone(), file);
                    }
                    LogAction::RemoveFile { path } => {
                        files.remove(&path);
                    }
                    LogAction::SetTableInfo(new_info) => {
                        info = Some(new_info);
                    }
                }
            }
        }

        let info = info.context(CorruptStateSnafu {
            msg: format!("No TableInfo found in commits up to version {current_version}"),
        })?;

        Ok(TableState {
            version: current_version,
            info,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageLocation;
    use crate::transaction_log::TableKind;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn file(path: &str, rows: u64) -> DataFile {
        DataFile {
            path: path.to_string(),
            partition_values: BTreeMap::from([("animal".to_string(), "a1".to_string())]),
            ts_min: Utc.timestamp_opt(0, 0).single().expect("valid ts"),
            ts_max: Utc.timestamp_opt(10, 0).single().expect("valid ts"),
            row_count: rows,
            file_size: 128,
        }
    }

    #[tokio::test]
    async fn rebuild_on_empty_log_is_corrupt_state() -> TestResult {
        let tmp = TempDir::new()?;
        let store = TransactionLogStore::new(StorageLocation::local(tmp.path()));

        let err = store
            .rebuild_table_state()
            .await
            .expect_err("empty log cannot be rebuilt");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_applies_adds_and_removes_in_order() -> TestResult {
        let tmp = TempDir::new()?;
        let store = TransactionLogStore::new(StorageLocation::local(tmp.path()));

        let info = TableInfo::new(TableKind::Data, "penguins");
        store
            .commit_with_expected_version(
                0,
                vec![
                    LogAction::SetTableInfo(info.clone()),
                    LogAction::AddFile(file("data/a.parquet", 10)),
                ],
            )
            .await?;
        store
            .commit_with_expected_version(
                1,
                vec![
                    LogAction::RemoveFile {
                        path: "data/a.parquet".to_string(),
                    },
                    LogAction::AddFile(file("data/b.parquet", 4)),
                    LogAction::AddFile(file("data/c.parquet", 6)),
                ],
            )
            .await?;

        let state = store.rebuild_table_state().await?;
        assert_eq!(state.version, 2);
        assert_eq!(state.info, info);
        let paths: Vec<_> = state.data_files().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["data/b.parquet", "data/c.parquet"]);
        assert_eq!(state.total_rows(), 10);
        Ok(())
    }

    #[tokio::test]
    async fn rebuild_without_table_info_is_corrupt_state() -> TestResult {
        let tmp = TempDir::new()?;
        let store = TransactionLogStore::new(StorageLocation::local(tmp.path()));

        store
            .commit_with_expected_version(0, vec![LogAction::AddFile(file("data/a.parquet", 1))])
            .await?;

        let err = store
            .rebuild_table_state()
            .await
            .expect_err("missing table info");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }
}
