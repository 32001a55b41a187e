//! Physical tables of a dataset.
//!
//! A [`LakeTable`] is one of the two physical tables (`data` or `events`) of a
//! dataset: a commit log plus the hive-partitioned Parquet files it references.
//! Writes conform the incoming batch to the fixed schema of the table, split it
//! by partition values, write one immutable file per partition and commit them
//! in a single log version. Reads go through a [`TableSnapshot`], which pins
//! the set of live files as of one version.

pub mod error;
pub mod schema;

mod scan;
mod write;

#[cfg(test)]
pub(crate) mod test_util;

use std::{fmt, path::Path, str::FromStr, sync::Arc};

use arrow::{array::RecordBatch, datatypes::SchemaRef};
use snafu::prelude::*;

pub use error::{TableError, TableResult};
pub use schema::{
    SignalType, UTC, conform_batch, data_schema, events_schema, table_schema, timestamp_type,
};

use crate::{
    storage::{self, StorageError, StorageLocation, layout},
    transaction_log::{
        CommitError, ConflictSnafu, DataFile, LogAction, TableInfo, TableKind, TableState,
        TransactionLogStore,
    },
};
use error::{
    AlreadyExistsSnafu, KindMismatchSnafu, NotFoundSnafu, StorageSnafu, TransactionLogSnafu,
};

/// How a write treats the rows already in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteMode {
    /// Add the new rows next to the existing ones.
    #[default]
    Append,
    /// Replace every existing row with the new ones.
    Overwrite,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Append => f.write_str("append"),
            WriteMode::Overwrite => f.write_str("overwrite"),
        }
    }
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" => Ok(WriteMode::Append),
            "overwrite" => Ok(WriteMode::Overwrite),
            other => Err(format!("unknown write mode {other:?}")),
        }
    }
}

/// Summary of one committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Table version after the write. Unchanged when nothing was committed.
    pub version: u64,
    /// Rows written.
    pub rows_written: u64,
    /// Data files added.
    pub files_added: usize,
    /// Data files logically removed (overwrite only).
    pub files_removed: usize,
}

/// Immutable view of one table version.
///
/// Files removed by later overwrites stay physically present, so a snapshot
/// remains readable after newer commits land.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    location: StorageLocation,
    state: Arc<TableState>,
}

impl TableSnapshot {
    /// Version this snapshot pins.
    pub fn version(&self) -> u64 {
        self.state.version
    }

    /// Kind of the table.
    pub fn kind(&self) -> TableKind {
        self.state.info.kind
    }

    /// Full replayed state.
    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Arrow schema of the table.
    pub fn schema(&self) -> SchemaRef {
        table_schema(self.kind())
    }

    /// Table root.
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Read all rows of one live data file.
    pub async fn read_file(&self, file: &DataFile) -> TableResult<Vec<RecordBatch>> {
        scan::read_data_file(&self.location, self.kind(), file).await
    }

    /// Read every row of the snapshot, file by file in path order.
    pub async fn read_all(&self) -> TableResult<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        for file in self.state.data_files() {
            batches.extend(self.read_file(file).await?);
        }
        Ok(batches)
    }
}

/// Handle to one physical table.
#[derive(Debug, Clone)]
pub struct LakeTable {
    log: TransactionLogStore,
    state: Arc<TableState>,
}

impl LakeTable {
    /// Create a new table at `location`, committing its [`TableInfo`] as
    /// version 1.
    ///
    /// Fails with [`TableError::AlreadyExists`] if any commit is present,
    /// including one made concurrently by another creator.
    pub async fn create(
        location: StorageLocation,
        kind: TableKind,
        dataset: &str,
    ) -> TableResult<Self> {
        let log = TransactionLogStore::new(location);
        let current = log
            .load_current_version()
            .await
            .context(TransactionLogSnafu)?;
        ensure!(
            current == 0,
            AlreadyExistsSnafu {
                location: log.location().to_string(),
                current_version: current,
            }
        );

        let info = TableInfo::new(kind, dataset);
        match log
            .commit_with_expected_version(0, vec![LogAction::SetTableInfo(info)])
            .await
        {
            Ok(_) => {}
            Err(CommitError::Conflict { found, .. }) => {
                return AlreadyExistsSnafu {
                    location: log.location().to_string(),
                    current_version: found,
                }
                .fail();
            }
            Err(source) => return Err(TableError::TransactionLog { source }),
        }

        let state = log.rebuild_table_state().await.context(TransactionLogSnafu)?;
        log::info!("created {kind} table for dataset {dataset} at {}", log.location());
        Ok(Self {
            log,
            state: Arc::new(state),
        })
    }

    /// Open the existing table at `location`, checking that it is a `kind`
    /// table.
    pub async fn open(location: StorageLocation, kind: TableKind) -> TableResult<Self> {
        let log = TransactionLogStore::new(location);
        let current = log
            .load_current_version()
            .await
            .context(TransactionLogSnafu)?;
        ensure!(
            current > 0,
            NotFoundSnafu {
                location: log.location().to_string(),
            }
        );

        let state = log.rebuild_table_state().await.context(TransactionLogSnafu)?;
        ensure!(
            state.info.kind == kind,
            KindMismatchSnafu {
                location: log.location().to_string(),
                expected: kind,
                found: state.info.kind,
            }
        );

        Ok(Self {
            log,
            state: Arc::new(state),
        })
    }

    /// Open the table, creating it first if the location is empty.
    pub async fn open_or_create(
        location: StorageLocation,
        kind: TableKind,
        dataset: &str,
    ) -> TableResult<Self> {
        match Self::open(location.clone(), kind).await {
            Ok(table) => Ok(table),
            Err(TableError::NotFound { .. }) => {
                match Self::create(location.clone(), kind, dataset).await {
                    Ok(table) => Ok(table),
                    // Lost a creation race; the winner's table is the one to use.
                    Err(TableError::AlreadyExists { .. }) => Self::open(location, kind).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Whether a table has been committed at `location`.
    pub async fn exists(location: &StorageLocation) -> TableResult<bool> {
        let log = TransactionLogStore::new(location.clone());
        let current = log
            .load_current_version()
            .await
            .context(TransactionLogSnafu)?;
        Ok(current > 0)
    }

    /// Reload the state if another handle committed since it was last read.
    ///
    /// Returns `true` when the version changed.
    pub async fn refresh(&mut self) -> TableResult<bool> {
        let current = self
            .log
            .load_current_version()
            .await
            .context(TransactionLogSnafu)?;
        if current == self.state.version {
            return Ok(false);
        }

        let state = self
            .log
            .rebuild_table_state()
            .await
            .context(TransactionLogSnafu)?;
        log::debug!(
            "{} table at {} moved from version {} to {}",
            self.kind(),
            self.location(),
            self.state.version,
            state.version
        );
        self.state = Arc::new(state);
        Ok(true)
    }

    /// Current in-memory state.
    pub fn state(&self) -> &TableState {
        &self.state
    }

    /// Version of the in-memory state.
    pub fn version(&self) -> u64 {
        self.state.version
    }

    /// Kind recorded in the log.
    pub fn kind(&self) -> TableKind {
        self.state.info.kind
    }

    /// Table root.
    pub fn location(&self) -> &StorageLocation {
        self.log.location()
    }

    /// Arrow schema of the table.
    pub fn schema(&self) -> SchemaRef {
        table_schema(self.kind())
    }

    /// Pin the current in-memory version for reading.
    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            location: self.location().clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Append `batch` as one commit.
    ///
    /// An empty batch commits nothing and reports the unchanged version.
    pub async fn append(&mut self, batch: &RecordBatch) -> TableResult<WriteOutcome> {
        self.write(batch, WriteMode::Append).await
    }

    /// Replace the whole table contents with `batch` in one commit.
    ///
    /// An empty batch leaves the table empty.
    pub async fn overwrite(&mut self, batch: &RecordBatch) -> TableResult<WriteOutcome> {
        self.write(batch, WriteMode::Overwrite).await
    }

    /// Write `batch` with the given mode.
    pub async fn write(
        &mut self,
        batch: &RecordBatch,
        mode: WriteMode,
    ) -> TableResult<WriteOutcome> {
        let kind = self.kind();
        let conformed = conform_batch(kind, batch)?;

        // Base the commit on the latest version so an idle handle does not
        // conflict with writes made through another handle.
        self.refresh().await?;
        let base = self.state.version;
        let version = base + 1;

        let mut actions = Vec::new();
        let mut files_removed = 0;
        if mode == WriteMode::Overwrite {
            for path in self.state.files.keys() {
                actions.push(LogAction::RemoveFile { path: path.clone() });
                files_removed += 1;
            }
        }

        let mut files_added = 0;
        if conformed.num_rows() > 0 {
            for (seq, slice) in write::split_by_partition(kind, &conformed)?
                .into_iter()
                .enumerate()
            {
                let partitions: Vec<(&str, &str)> = slice
                    .values
                    .iter()
                    .map(|(c, v)| (c.as_str(), v.as_str()))
                    .collect();
                let rel = layout::data_file_rel_path(&partitions, version, seq);
                let path = rel_path_string(&rel);

                let bytes = write::encode_parquet(&path, &slice.batch)?;
                let (ts_min, ts_max) = write::time_bounds(kind, &slice.batch)?;
                self.write_data_file(&rel, &bytes, base, version).await?;

                actions.push(LogAction::AddFile(DataFile {
                    path,
                    partition_values: slice.values.into_iter().collect(),
                    ts_min,
                    ts_max,
                    row_count: slice.batch.num_rows() as u64,
                    file_size: bytes.len() as u64,
                }));
                files_added += 1;
            }
        }

        if actions.is_empty() {
            return Ok(WriteOutcome {
                version: base,
                rows_written: 0,
                files_added: 0,
                files_removed: 0,
            });
        }

        let committed = self
            .log
            .commit_with_expected_version(base, actions.clone())
            .await
            .context(TransactionLogSnafu)?;

        let mut state = TableState::clone(&self.state);
        state.version = committed;
        for action in actions {
            match action {
                LogAction::AddFile(file) => {
                    state.files.insert(file.path.clone(), file);
                }
                LogAction::RemoveFile { path } => {
                    state.files.remove(&path);
                }
                LogAction::SetTableInfo(info) => state.info = info,
            }
        }
        self.state = Arc::new(state);

        log::info!(
            "{mode} of {} rows into {kind} table at {} committed as version {committed}",
            conformed.num_rows(),
            self.location()
        );
        Ok(WriteOutcome {
            version: committed,
            rows_written: conformed.num_rows() as u64,
            files_added,
            files_removed,
        })
    }

    async fn write_data_file(
        &self,
        rel: &Path,
        bytes: &[u8],
        base: u64,
        version: u64,
    ) -> TableResult<()> {
        match storage::write_new(self.location(), rel, bytes).await {
            Ok(()) => Ok(()),
            // Another writer already produced files for this version.
            Err(StorageError::AlreadyExists { .. }) => Err(TableError::TransactionLog {
                source: ConflictSnafu {
                    expected: base,
                    found: version,
                }
                .build(),
            }),
            Err(source) => Err(source).context(StorageSnafu),
        }
    }

    /// Delete every object under the table root, log included.
    ///
    /// Open snapshots of the table become unreadable.
    pub async fn delete_storage(location: &StorageLocation) -> TableResult<()> {
        storage::remove_all(location, Path::new(""))
            .await
            .context(StorageSnafu)
    }
}

fn rel_path_string(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake_table::test_util::{events_batch, signal_batch};
    use arrow::array::{AsArray, RecordBatch};
    use arrow::datatypes::Float64Type;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn values(batches: &[RecordBatch]) -> Vec<f64> {
        let mut out: Vec<f64> = batches
            .iter()
            .flat_map(|b| {
                b.column_by_name("val_dbl")
                    .map(|c| c.as_primitive::<Float64Type>().values().to_vec())
                    .unwrap_or_default()
            })
            .collect();
        out.sort_by(f64::total_cmp);
        out
    }

    #[tokio::test]
    async fn create_then_open_roundtrips_info() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("ds.db/data"));

        let created = LakeTable::create(location.clone(), TableKind::Data, "ds").await?;
        assert_eq!(created.version(), 1);

        let opened = LakeTable::open(location.clone(), TableKind::Data).await?;
        assert_eq!(opened.state().info.dataset, "ds");
        assert!(LakeTable::exists(&location).await?);

        let err = LakeTable::create(location.clone(), TableKind::Data, "ds")
            .await
            .expect_err("second create");
        assert!(matches!(err, TableError::AlreadyExists { current_version: 1, .. }));

        let err = LakeTable::open(location, TableKind::Events)
            .await
            .expect_err("wrong kind");
        assert!(matches!(err, TableError::KindMismatch { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn open_missing_table_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("none"));

        let err = LakeTable::open(location.clone(), TableKind::Data)
            .await
            .expect_err("no table");
        assert!(matches!(err, TableError::NotFound { .. }));
        assert!(!LakeTable::exists(&location).await?);
        Ok(())
    }

    #[tokio::test]
    async fn open_or_create_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));

        let first = LakeTable::open_or_create(location.clone(), TableKind::Events, "ds").await?;
        let second = LakeTable::open_or_create(location, TableKind::Events, "ds").await?;
        assert_eq!(first.version(), 1);
        assert_eq!(second.version(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn append_partitions_rows_and_records_statistics() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut table = LakeTable::create(location, TableKind::Data, "ds").await?;

        let batch = signal_batch(&[
            ("a1", "depth", 0, 1.0),
            ("a1", "depth", 10, 2.0),
            ("a2", "temp", 5, 3.0),
        ])?;
        let outcome = table.append(&batch).await?;
        assert_eq!(
            outcome,
            WriteOutcome {
                version: 2,
                rows_written: 3,
                files_added: 2,
                files_removed: 0,
            }
        );

        let state = table.state();
        assert_eq!(state.total_rows(), 3);
        let depth = state
            .data_files()
            .find(|f| f.partition_value("label") == Some("depth"))
            .expect("depth file");
        assert_eq!(depth.ts_min.timestamp(), 0);
        assert_eq!(depth.ts_max.timestamp(), 10);
        assert!(depth.path.starts_with("data/animal=a1/deployment=d1/class=sensor/label=depth/"));

        let batches = table.snapshot().read_all().await?;
        assert_eq!(values(&batches), vec![1.0, 2.0, 3.0]);
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_replaces_rows_but_old_snapshot_stays_readable() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut table = LakeTable::create(location, TableKind::Data, "ds").await?;

        table
            .append(&signal_batch(&[("a1", "depth", 0, 1.0), ("a1", "depth", 1, 2.0)])?)
            .await?;
        let before = table.snapshot();

        let outcome = table
            .overwrite(&signal_batch(&[("a1", "depth", 0, 9.0)])?)
            .await?;
        assert_eq!(outcome.files_removed, 1);
        assert_eq!(outcome.files_added, 1);

        assert_eq!(values(&table.snapshot().read_all().await?), vec![9.0]);
        assert_eq!(values(&before.read_all().await?), vec![1.0, 2.0]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_append_commits_nothing() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut table = LakeTable::create(location, TableKind::Data, "ds").await?;

        let outcome = table.append(&signal_batch(&[])?).await?;
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.rows_written, 0);
        assert_eq!(table.version(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_handle_refreshes_before_committing() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut a = LakeTable::create(location.clone(), TableKind::Events, "ds").await?;
        let mut b = LakeTable::open(location, TableKind::Events).await?;

        a.append(&events_batch(&[("a1", "dive", 0, Some(30))])?).await?;
        let outcome = b.append(&events_batch(&[("a1", "surface", 40, None)])?).await?;

        assert_eq!(outcome.version, 3);
        assert_eq!(b.state().total_rows(), 2);
        assert!(a.refresh().await?);
        assert_eq!(a.state().total_rows(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn schema_mismatch_is_rejected_before_any_io() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut table = LakeTable::create(location, TableKind::Events, "ds").await?;

        let err = table
            .append(&signal_batch(&[("a1", "depth", 0, 1.0)])?)
            .await
            .expect_err("data rows into events table");
        assert!(matches!(err, TableError::SchemaMismatch { .. }));
        assert_eq!(table.version(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_storage_removes_table() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StorageLocation::local(tmp.path().join("t"));
        let mut table = LakeTable::create(location.clone(), TableKind::Data, "ds").await?;
        table.append(&signal_batch(&[("a1", "depth", 0, 1.0)])?).await?;

        LakeTable::delete_storage(&location).await?;
        assert!(!LakeTable::exists(&location).await?);
        Ok(())
    }

    #[test]
    fn write_mode_parses_case_insensitively() {
        assert_eq!("Overwrite".parse::<WriteMode>(), Ok(WriteMode::Overwrite));
        assert_eq!("append".parse::<WriteMode>(), Ok(WriteMode::Append));
        assert!("upsert".parse::<WriteMode>().is_err());
    }
}
