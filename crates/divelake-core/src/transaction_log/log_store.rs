//! Async helpers for persisting and reading the commit log.
//!
//! This module owns all storage interactions with `_lake_log/`:
//! - Tracking the `CURRENT` pointer and interpreting the "no file" case as
//!   version `0` (fresh table).
//! - Writing zero-padded commit files with optimistic concurrency control so
//!   each version is created exactly once.
//! - Mapping storage-layer failures into [`CommitError`] variants so callers
//!   can differentiate between conflicts, storage errors, and corrupt state.
use std::path::Path;

use chrono::Utc;
use snafu::{Backtrace, prelude::*};

use crate::storage::{self, StorageError, StorageLocation, layout};
use crate::transaction_log::{Commit, CommitError, ConflictSnafu, CorruptStateSnafu, LogAction};

/// Helper for reading and writing the commit log under a table root.
///
/// Layout:
///   <root>/_lake_log/0000000001.json
///   <root>/_lake_log/0000000002.json
///   <root>/_lake_log/CURRENT
#[derive(Debug, Clone)]
pub struct TransactionLogStore {
    location: StorageLocation,
}

impl TransactionLogStore {
    /// Create a new store rooted at a table directory.
    pub fn new(location: StorageLocation) -> Self {
        Self { location }
    }

    /// The table root this log belongs to.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    async fn read_to_string_rel(&self, rel: &Path) -> Result<String, CommitError> {
        storage::read_to_string(&self.location, rel)
            .await
            .map_err(|source| CommitError::Storage { source })
    }

    /// Load a single commit by version.
    ///
    /// - On storage-layer failures, returns `CommitError::Storage`.
    /// - On JSON parse failures, returns `CommitError::CorruptState`.
    pub async fn load_commit(&self, version: u64) -> Result<Commit, CommitError> {
        let rel = layout::commit_rel_path(version);
        let json = self.read_to_string_rel(&rel).await?;

        serde_json::from_str(&json).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to parse commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })
    }

    /// Load the CURRENT version pointer.
    ///
    /// - If CURRENT does not exist, the table is fresh and this returns 0.
    /// - If CURRENT contains invalid or empty content, returns CorruptState.
    pub async fn load_current_version(&self) -> Result<u64, CommitError> {
        let rel = layout::current_rel_path();

        let contents = match storage::read_to_string(&self.location, &rel).await {
            Ok(s) => s,
            Err(StorageError::NotFound { .. }) => return Ok(0),
            Err(source) => return Err(CommitError::Storage { source }),
        };

        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return CorruptStateSnafu {
                msg: format!("CURRENT has empty content at {rel:?}"),
            }
            .fail();
        }

        trimmed
            .parse::<u64>()
            .map_err(|e| CommitError::CorruptState {
                msg: format!("CURRENT has invalid content {trimmed:?}: {e}"),
                backtrace: Backtrace::capture(),
            })
    }

    /// Commit a new version with an optimistic concurrency guard.
    ///
    /// The CURRENT check is advisory. The real guard is the create-only-if-absent
    /// write of the commit file: if another writer created the same version
    /// first, this returns `CommitError::Conflict`.
    ///
    /// If the commit file is written but updating CURRENT fails, the orphaned
    /// commit is invisible to readers, which only replay up to CURRENT, and the
    /// next writer for that version will report a conflict.
    pub async fn commit_with_expected_version(
        &self,
        expected: u64,
        actions: Vec<LogAction>,
    ) -> Result<u64, CommitError> {
        let current = self.load_current_version().await?;
        if current != expected {
            return ConflictSnafu {
                expected,
                found: current,
            }
            .fail();
        }

        let version = expected.checked_add(1).context(CorruptStateSnafu {
            msg: "version counter overflow".to_string(),
        })?;

        let commit = Commit {
            version,
            base_version: expected,
            timestamp: Utc::now(),
            actions,
        };

        let json = serde_json::to_vec(&commit).map_err(|e| CommitError::CorruptState {
            msg: format!("failed to serialize commit {version}: {e}"),
            backtrace: Backtrace::capture(),
        })?;

        let commit_rel = layout::commit_rel_path(version);
        match storage::write_new(&self.location, &commit_rel, &json).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => {
                return ConflictSnafu {
                    expected,
                    found: version,
                }
                .fail();
            }
            Err(source) => return Err(CommitError::Storage { source }),
        }

        let current_contents = format!("{version}\n");
        storage::write_atomic(
            &self.location,
            &layout::current_rel_path(),
            current_contents.as_bytes(),
        )
        .await
        .map_err(|source| CommitError::Storage { source })?;

        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction_log::{TableInfo, TableKind};
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn create_test_log_store() -> (TempDir, TransactionLogStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let location = StorageLocation::local(tmp.path());
        let store = TransactionLogStore::new(location);
        (tmp, store)
    }

    #[tokio::test]
    async fn load_current_version_returns_zero_when_no_current_file() -> TestResult {
        let (_tmp, store) = create_test_log_store();
        assert_eq!(store.load_current_version().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn load_current_version_handles_whitespace() -> TestResult {
        let (tmp, store) = create_test_log_store();

        let log_dir = tmp.path().join(layout::LOG_DIR_NAME);
        tokio::fs::create_dir_all(&log_dir).await?;
        tokio::fs::write(log_dir.join(layout::CURRENT_FILE_NAME), "  42  \n").await?;

        assert_eq!(store.load_current_version().await?, 42);
        Ok(())
    }

    #[tokio::test]
    async fn load_current_version_returns_corrupt_state_for_invalid_content() -> TestResult {
        let (tmp, store) = create_test_log_store();

        let log_dir = tmp.path().join(layout::LOG_DIR_NAME);
        tokio::fs::create_dir_all(&log_dir).await?;
        tokio::fs::write(log_dir.join(layout::CURRENT_FILE_NAME), "not-a-number").await?;

        let err = store
            .load_current_version()
            .await
            .expect_err("expected CorruptState");
        assert!(matches!(err, CommitError::CorruptState { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn commit_first_version_writes_commit_and_current() -> TestResult {
        let (tmp, store) = create_test_log_store();

        let info = TableInfo::new(TableKind::Data, "penguins");
        let version = store
            .commit_with_expected_version(0, vec![LogAction::SetTableInfo(info.clone())])
            .await?;
        assert_eq!(version, 1);
        assert_eq!(store.load_current_version().await?, 1);

        assert!(tmp.path().join(layout::commit_rel_path(1)).exists());
        let commit = store.load_commit(1).await?;
        assert_eq!(commit.base_version, 0);
        assert_eq!(commit.actions, vec![LogAction::SetTableInfo(info)]);
        Ok(())
    }

    #[tokio::test]
    async fn commit_with_stale_expected_version_conflicts() -> TestResult {
        let (_tmp, store) = create_test_log_store();

        store.commit_with_expected_version(0, vec![]).await?;
        let err = store
            .commit_with_expected_version(0, vec![])
            .await
            .expect_err("stale writer must conflict");
        assert!(matches!(
            err,
            CommitError::Conflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn existing_commit_file_is_reported_as_conflict() -> TestResult {
        let (tmp, store) = create_test_log_store();

        // Another writer created version 1 but has not advanced CURRENT yet.
        let commit_path = tmp.path().join(layout::commit_rel_path(1));
        tokio::fs::create_dir_all(commit_path.parent().expect("log dir")).await?;
        tokio::fs::write(&commit_path, "{}").await?;

        let err = store
            .commit_with_expected_version(0, vec![])
            .await
            .expect_err("create-new guard must fire");
        assert!(matches!(err, CommitError::Conflict { .. }));
        assert_eq!(store.load_current_version().await?, 0);
        Ok(())
    }
}
