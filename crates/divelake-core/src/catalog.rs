//! Catalog bookkeeping: which datasets exist and where their tables live.
//!
//! The catalog is a single JSON document (`catalog.json`) kept on the local
//! filesystem, in the warehouse root for the local backend and in the catalog
//! directory for object storage. It records, per dataset, a lifecycle state
//! and the last snapshot version observed for each of its two tables. The
//! table commit logs stay the source of truth for contents; the catalog only
//! answers "which datasets should be visible" and "was a lifecycle step
//! interrupted".
//!
//! Every mutation rewrites the document with [`storage::write_atomic`], so a
//! crash leaves either the previous or the new catalog, never a torn one.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tokio::sync::Mutex;

use crate::{
    config::{ConfigError, WarehouseConfig},
    storage::{self, StorageError, StorageLocation, layout},
    transaction_log::TableKind,
};

/// File name of the catalog document.
pub const CATALOG_FILE_NAME: &str = "catalog.json";

const CATALOG_FORMAT_VERSION: u32 = 1;

/// Errors raised by the catalog.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CatalogError {
    /// The warehouse configuration could not be turned into a location.
    #[snafu(display("Invalid warehouse configuration: {source}"))]
    Config {
        /// Underlying configuration error.
        #[snafu(backtrace)]
        source: ConfigError,
    },

    /// Reading or writing the catalog document failed.
    #[snafu(display("Catalog storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// The catalog document is not valid JSON of the expected shape.
    #[snafu(display("Corrupt catalog at {}: {source}", path.display()))]
    Corrupt {
        /// Path of the catalog document.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The catalog document belongs to another warehouse.
    #[snafu(display(
        "Catalog at {} tracks warehouse {recorded}, not {requested}",
        path.display()
    ))]
    WarehouseMismatch {
        /// Path of the catalog document.
        path: PathBuf,
        /// Warehouse recorded in the document.
        recorded: String,
        /// Warehouse of the current configuration.
        requested: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A dataset name that cannot be used as a directory and view prefix.
    #[snafu(display(
        "Invalid dataset name {name:?}: use letters, digits, '_' or '-', \
         starting with a letter or digit"
    ))]
    InvalidDatasetName {
        /// The rejected name.
        name: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A lifecycle step was requested for a dataset the catalog does not know.
    #[snafu(display("Dataset {name:?} is not registered in the catalog"))]
    UnknownDataset {
        /// Dataset name.
        name: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Convenience result alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Lifecycle state of a dataset as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    /// Tables are being created; not yet visible to readers.
    Initializing,
    /// Both tables exist and views may be registered.
    Ready,
    /// Removal started; tables may be partially deleted.
    Removing,
}

impl std::fmt::Display for DatasetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DatasetState::Initializing => "initializing",
            DatasetState::Ready => "ready",
            DatasetState::Removing => "removing",
        })
    }
}

/// Per-table bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Which table this is.
    pub kind: TableKind,
    /// Path of the table root relative to the warehouse root.
    pub path: String,
    /// Last committed version the catalog observed.
    pub snapshot_version: u64,
}

/// Per-dataset bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    /// Lifecycle state.
    pub state: DatasetState,
    /// When the dataset was first registered.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
    /// Tables registered so far, in kind order.
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

impl DatasetEntry {
    /// Entry for one table kind, if registered.
    pub fn table(&self, kind: TableKind) -> Option<&TableEntry> {
        self.tables.iter().find(|t| t.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CatalogDocument {
    format_version: u32,
    warehouse: String,
    #[serde(default)]
    datasets: BTreeMap<String, DatasetEntry>,
}

/// Check that `name` can serve as a dataset directory and view prefix.
pub fn validate_dataset_name(name: &str) -> CatalogResult<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ensure!(valid, InvalidDatasetNameSnafu { name });
    Ok(())
}

/// Handle to the catalog of one warehouse.
///
/// Opening is idempotent: the same configuration always resolves to the same
/// `catalog.json`, which is created only if absent. Mutations are serialized
/// through an internal lock and persisted before they return.
#[derive(Debug)]
pub struct CatalogManager {
    warehouse: StorageLocation,
    warehouse_uri: String,
    bookkeeping: StorageLocation,
    document: Mutex<CatalogDocument>,
}

impl CatalogManager {
    /// Open (creating if needed) the catalog for `config`.
    pub async fn open(config: &WarehouseConfig) -> CatalogResult<Self> {
        let warehouse = config.storage_location().context(ConfigSnafu)?;
        Self::open_at(warehouse, config.warehouse_uri(), config.catalog_dir()).await
    }

    /// Open a catalog for an explicit warehouse location, keeping the
    /// bookkeeping document in `catalog_dir`.
    pub async fn open_at(
        warehouse: StorageLocation,
        warehouse_uri: String,
        catalog_dir: &Path,
    ) -> CatalogResult<Self> {
        let bookkeeping = StorageLocation::local(catalog_dir);
        let rel = Path::new(CATALOG_FILE_NAME);
        let path = catalog_dir.join(CATALOG_FILE_NAME);

        let document = match storage::read_to_string(&bookkeeping, rel).await {
            Ok(json) => {
                let document: CatalogDocument =
                    serde_json::from_str(&json).context(CorruptSnafu { path: path.clone() })?;
                ensure!(
                    document.warehouse == warehouse_uri,
                    WarehouseMismatchSnafu {
                        path,
                        recorded: document.warehouse.clone(),
                        requested: warehouse_uri.clone(),
                    }
                );
                log::debug!(
                    "opened catalog {} with {} datasets",
                    path.display(),
                    document.datasets.len()
                );
                document
            }
            Err(StorageError::NotFound { .. }) => {
                let document = CatalogDocument {
                    format_version: CATALOG_FORMAT_VERSION,
                    warehouse: warehouse_uri.clone(),
                    datasets: BTreeMap::new(),
                };
                persist(&bookkeeping, &document).await?;
                log::info!("created catalog {} for warehouse {warehouse_uri}", path.display());
                document
            }
            Err(source) => return Err(CatalogError::Storage { source }),
        };

        Ok(Self {
            warehouse,
            warehouse_uri,
            bookkeeping,
            document: Mutex::new(document),
        })
    }

    /// Root of the warehouse holding table data.
    pub fn warehouse(&self) -> &StorageLocation {
        &self.warehouse
    }

    /// Human-readable warehouse URI.
    pub fn warehouse_uri(&self) -> &str {
        &self.warehouse_uri
    }

    /// Location of the bookkeeping document's directory.
    pub fn bookkeeping(&self) -> &StorageLocation {
        &self.bookkeeping
    }

    /// Root of one table of `dataset`.
    pub fn table_location(&self, dataset: &str, kind: TableKind) -> StorageLocation {
        self.warehouse.join(layout::table_rel_dir(dataset, kind.name()))
    }

    /// Root directory of `dataset`.
    pub fn dataset_location(&self, dataset: &str) -> StorageLocation {
        self.warehouse.join(layout::dataset_rel_dir(dataset))
    }

    /// Entry for `dataset`, if registered.
    pub async fn dataset(&self, dataset: &str) -> Option<DatasetEntry> {
        self.document.lock().await.datasets.get(dataset).cloned()
    }

    /// All registered datasets in name order.
    pub async fn datasets(&self) -> Vec<(String, DatasetEntry)> {
        self.document
            .lock()
            .await
            .datasets
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    /// Record that initialization of `dataset` started.
    ///
    /// A `Ready` dataset is left untouched; any other entry is reset to
    /// `Initializing` so an interrupted attempt can be resumed.
    pub async fn begin_initialize(&self, dataset: &str) -> CatalogResult<DatasetState> {
        validate_dataset_name(dataset)?;
        self.mutate(|doc| {
            let now = Utc::now();
            let entry = doc
                .datasets
                .entry(dataset.to_string())
                .or_insert_with(|| DatasetEntry {
                    state: DatasetState::Initializing,
                    created_at: now,
                    updated_at: now,
                    tables: Vec::new(),
                });
            if entry.state != DatasetState::Ready {
                entry.state = DatasetState::Initializing;
                entry.updated_at = now;
            }
            Ok(entry.state)
        })
        .await
    }

    /// Record the table versions of `dataset` and mark it `Ready`.
    pub async fn mark_ready(
        &self,
        dataset: &str,
        tables: &[(TableKind, u64)],
    ) -> CatalogResult<()> {
        self.mutate(|doc| {
            let entry = doc
                .datasets
                .get_mut(dataset)
                .context(UnknownDatasetSnafu { name: dataset })?;
            entry.tables = tables
                .iter()
                .map(|(kind, version)| TableEntry {
                    kind: *kind,
                    path: rel_string(&layout::table_rel_dir(dataset, kind.name())),
                    snapshot_version: *version,
                })
                .collect();
            entry.state = DatasetState::Ready;
            entry.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Advance the recorded snapshot pointer of one table after a write.
    pub async fn record_snapshot(
        &self,
        dataset: &str,
        kind: TableKind,
        version: u64,
    ) -> CatalogResult<()> {
        self.mutate(|doc| {
            let entry = doc
                .datasets
                .get_mut(dataset)
                .context(UnknownDatasetSnafu { name: dataset })?;
            match entry.tables.iter_mut().find(|t| t.kind == kind) {
                Some(table) => table.snapshot_version = version,
                None => entry.tables.push(TableEntry {
                    kind,
                    path: rel_string(&layout::table_rel_dir(dataset, kind.name())),
                    snapshot_version: version,
                }),
            }
            entry.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Mark `dataset` as being removed. Returns `false` if it is unknown.
    pub async fn mark_removing(&self, dataset: &str) -> CatalogResult<bool> {
        self.mutate(|doc| {
            Ok(match doc.datasets.get_mut(dataset) {
                Some(entry) => {
                    entry.state = DatasetState::Removing;
                    entry.updated_at = Utc::now();
                    true
                }
                None => false,
            })
        })
        .await
    }

    /// Drop the entry of `dataset`. Unknown names are ignored.
    pub async fn forget(&self, dataset: &str) -> CatalogResult<()> {
        self.mutate(|doc| {
            doc.datasets.remove(dataset);
            Ok(())
        })
        .await
    }

    /// Names of datasets present in warehouse storage, whether or not the
    /// catalog knows them.
    ///
    /// A dataset is a `<name>.db` directory; hidden and underscore-prefixed
    /// directories are skipped.
    pub async fn discover_stored_datasets(&self) -> CatalogResult<Vec<String>> {
        let dirs = storage::list_child_dirs(&self.warehouse, Path::new(""))
            .await
            .context(StorageSnafu)?;
        Ok(dirs
            .iter()
            .filter(|d| !d.starts_with('.') && !d.starts_with('_'))
            .filter_map(|d| layout::dataset_name_from_dir(d))
            .filter(|name| validate_dataset_name(name).is_ok())
            .map(str::to_string)
            .collect())
    }

    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut CatalogDocument) -> CatalogResult<T>,
    ) -> CatalogResult<T> {
        let mut guard = self.document.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next != *guard {
            persist(&self.bookkeeping, &next).await?;
            *guard = next;
        }
        Ok(out)
    }
}

async fn persist(location: &StorageLocation, document: &CatalogDocument) -> CatalogResult<()> {
    let json = serde_json::to_vec_pretty(document).context(CorruptSnafu {
        path: PathBuf::from(CATALOG_FILE_NAME),
    })?;
    storage::write_atomic(location, Path::new(CATALOG_FILE_NAME), &json)
        .await
        .context(StorageSnafu)
}

fn rel_string(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
