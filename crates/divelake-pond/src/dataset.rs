//! Dataset lifecycle and the views derived from its tables.
//!
//! Each dataset owns two physical tables and two views registered with the
//! analytics session:
//!
//! | table               | view              |
//! |---------------------|-------------------|
//! | `<name>.db/data`    | `<name>_Data`     |
//! | `<name>.db/events`  | `<name>_Events`   |
//!
//! A view is a plain projection of one pinned table snapshot. Refreshing a
//! view re-registers it over the table's latest version, which is how writes
//! become visible to later reads. Queries that already hold the old view keep
//! reading the old snapshot.
//!
//! The catalog tracks each dataset as `initializing`, `ready` or `removing`.
//! Anything other than `ready` after a call returns means a step failed
//! halfway; [`DatasetManager::reconcile`] reports such datasets and never
//! repairs them.

use std::{collections::HashMap, fmt, sync::Arc};

use datafusion::{
    catalog::view::ViewTable,
    common::TableReference,
    datasource::provider_as_source,
    logical_expr::LogicalPlanBuilder,
};
use divelake_core::{
    catalog::{CatalogManager, DatasetState},
    lake_table::{LakeTable, TableError, TableSnapshot},
    storage::{self, layout},
    transaction_log::TableKind,
};
use divelake_datafusion::LakeTableProvider;
use snafu::prelude::*;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    connection::AnalyticsConnection,
    error::{
        CatalogSnafu, DatasetInconsistentSnafu, DatasetNotFoundSnafu, EngineInitSnafu,
        PondError, PondResult, StorageSnafu, TableSnafu, ViewSnafu,
    },
};

/// Name of the view over `kind` of `dataset`.
pub fn view_name(dataset: &str, kind: TableKind) -> String {
    format!("{dataset}_{}", kind.view_suffix())
}

/// Something [`DatasetManager::reconcile`] found wrong with a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    /// Initialization started but never completed.
    Initializing,
    /// Removal started but never completed.
    Removing,
    /// The catalog says `ready` but a table is gone from storage.
    MissingTable(TableKind),
    /// Storage holds a dataset directory the catalog does not track, and its
    /// tables are not both present.
    PartialUntracked {
        /// Tables found in storage.
        present: Vec<TableKind>,
    },
    /// A ready dataset has no view registered for `kind`.
    MissingView(TableKind),
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::Initializing => f.write_str("initialization did not complete"),
            Inconsistency::Removing => f.write_str("removal did not complete"),
            Inconsistency::MissingTable(kind) => write!(f, "{kind} table is missing from storage"),
            Inconsistency::PartialUntracked { present } => {
                let present: Vec<_> = present.iter().map(|k| k.name()).collect();
                write!(
                    f,
                    "untracked dataset directory with only [{}] table(s)",
                    present.join(", ")
                )
            }
            Inconsistency::MissingView(kind) => write!(f, "{kind} view is not registered"),
        }
    }
}

/// One reconciliation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Affected dataset.
    pub dataset: String,
    /// What is wrong.
    pub issue: Inconsistency,
}

/// Owner of dataset lifecycle and view registration.
#[derive(Debug)]
pub struct DatasetManager {
    catalog: Arc<CatalogManager>,
    connection: Arc<AnalyticsConnection>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatasetManager {
    /// Manager over an opened catalog and session. Call
    /// [`Self::load_existing`] to register views of datasets already in the
    /// warehouse.
    pub fn new(catalog: Arc<CatalogManager>, connection: Arc<AnalyticsConnection>) -> Self {
        Self {
            catalog,
            connection,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The catalog this manager records lifecycle state in.
    pub fn catalog(&self) -> &CatalogManager {
        &self.catalog
    }

    /// Exclusive in-process lock for writes into `dataset`.
    pub(crate) async fn lock_dataset(&self, dataset: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(dataset.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Register views for every usable dataset in the warehouse.
    ///
    /// Ready catalog entries get their views registered. Datasets found in
    /// storage with both tables but unknown to the catalog are adopted.
    /// Anything else is left for [`Self::reconcile`] to report. Returns the
    /// names whose views are now registered.
    pub async fn load_existing(&self) -> PondResult<Vec<String>> {
        let mut loaded = Vec::new();

        for (name, entry) in self.catalog.datasets().await {
            if entry.state != DatasetState::Ready {
                log::warn!("skipping dataset {name}: catalog state is {}", entry.state);
                continue;
            }
            match self.refresh_views(&name).await {
                Ok(_) => loaded.push(name),
                Err(e) => log::warn!("skipping dataset {name}: {e}"),
            }
        }

        for name in self.catalog.discover_stored_datasets().await.context(CatalogSnafu)? {
            if self.catalog.dataset(&name).await.is_some() {
                continue;
            }
            let present = self.stored_tables(&name).await?;
            if present.len() != TableKind::ALL.len() {
                log::warn!("not adopting dataset {name}: only {present:?} table(s) in storage");
                continue;
            }
            self.catalog.begin_initialize(&name).await.context(CatalogSnafu)?;
            let versions = self.open_tables(&name).await?;
            self.catalog
                .mark_ready(&name, &versions)
                .await
                .context(CatalogSnafu)?;
            self.refresh_views(&name).await?;
            log::info!("adopted dataset {name} found in storage");
            loaded.push(name);
        }

        loaded.sort();
        Ok(loaded)
    }

    /// Make sure `dataset` has both tables and both views.
    ///
    /// A ready dataset is left as is, apart from registering its views if
    /// this session has not seen them yet. Otherwise the tables are created
    /// (or opened, when a previous attempt got that far), the dataset is
    /// marked ready and its views are registered.
    pub async fn ensure_dataset_initialized(&self, dataset: &str) -> PondResult<()> {
        let _guard = self.lock_dataset(dataset).await;

        match self.catalog.dataset(dataset).await.map(|e| e.state) {
            Some(DatasetState::Ready) => {
                if !self.views_registered(dataset).await? {
                    self.refresh_views(dataset).await?;
                }
                return Ok(());
            }
            Some(DatasetState::Removing) => {
                return DatasetInconsistentSnafu {
                    dataset,
                    reason: "a previous removal did not complete",
                }
                .fail();
            }
            Some(DatasetState::Initializing) | None => {}
        }

        self.catalog
            .begin_initialize(dataset)
            .await
            .context(CatalogSnafu)?;
        let versions = self.create_tables(dataset).await?;
        self.catalog
            .mark_ready(dataset, &versions)
            .await
            .context(CatalogSnafu)?;
        self.refresh_views(dataset).await?;
        log::info!("initialized dataset {dataset}");
        Ok(())
    }

    /// Fail unless `dataset` is ready for queries.
    pub async fn require_ready(&self, dataset: &str) -> PondResult<()> {
        match self.catalog.dataset(dataset).await.map(|e| e.state) {
            Some(DatasetState::Ready) => {
                if !self.views_registered(dataset).await? {
                    self.refresh_views(dataset).await?;
                }
                Ok(())
            }
            Some(state) => DatasetInconsistentSnafu {
                dataset,
                reason: format!("catalog state is {state}"),
            }
            .fail(),
            None => DatasetNotFoundSnafu { dataset }.fail(),
        }
    }

    /// Names of datasets that are ready and have both views registered.
    pub async fn get_all_datasets(&self) -> PondResult<Vec<String>> {
        let mut names = Vec::new();
        for (name, entry) in self.catalog.datasets().await {
            if entry.state == DatasetState::Ready && self.views_registered(&name).await? {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Whether `dataset` is ready with both views registered.
    pub async fn dataset_exists(&self, dataset: &str) -> PondResult<bool> {
        let ready = matches!(
            self.catalog.dataset(dataset).await.map(|e| e.state),
            Some(DatasetState::Ready)
        );
        Ok(ready && self.views_registered(dataset).await?)
    }

    /// Drop both views and both tables of `dataset`, then forget it.
    ///
    /// Irreversible. The dataset is marked `removing` first; if any later
    /// step fails it stays marked and the error is reported as
    /// [`PondError::DatasetInconsistent`].
    pub async fn remove_dataset(&self, dataset: &str) -> PondResult<()> {
        let _guard = self.lock_dataset(dataset).await;

        let known = self
            .catalog
            .mark_removing(dataset)
            .await
            .context(CatalogSnafu)?;
        ensure!(known, DatasetNotFoundSnafu { dataset });
        log::info!("removing dataset {dataset}");

        if let Err(e) = self.drop_dataset(dataset).await {
            log::warn!("removal of dataset {dataset} failed halfway: {e}");
            return DatasetInconsistentSnafu {
                dataset,
                reason: format!("removal failed after it started: {e}"),
            }
            .fail();
        }
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &str) -> PondResult<()> {
        {
            let ctx = self.connection.acquire().await.context(EngineInitSnafu)?;
            for kind in TableKind::ALL {
                let view = view_name(dataset, kind);
                ctx.deregister_table(TableReference::bare(view.as_str()))
                    .context(ViewSnafu { view })?;
            }
        }

        for kind in TableKind::ALL {
            LakeTable::delete_storage(&self.catalog.table_location(dataset, kind))
                .await
                .context(TableSnafu { dataset, kind })?;
        }
        storage::remove_all(self.catalog.warehouse(), &layout::dataset_rel_dir(dataset))
            .await
            .context(StorageSnafu)?;

        self.catalog.forget(dataset).await.context(CatalogSnafu)?;
        log::info!("removed dataset {dataset}");
        Ok(())
    }

    /// Re-register both views of `dataset` over the latest table versions.
    ///
    /// Returns the `(data, events)` versions now visible.
    pub async fn refresh_views(&self, dataset: &str) -> PondResult<(u64, u64)> {
        let data = self.refresh_view(dataset, TableKind::Data).await?;
        let events = self.refresh_view(dataset, TableKind::Events).await?;
        Ok((data, events))
    }

    /// Re-register the view over `kind` of `dataset`. Returns the version
    /// now visible.
    pub async fn refresh_view(&self, dataset: &str, kind: TableKind) -> PondResult<u64> {
        let table = self.open_table(dataset, kind).await?;
        self.publish(dataset, table.snapshot()).await?;
        Ok(table.version())
    }

    /// Make `snapshot` the version readers of its view see, and record it in
    /// the catalog.
    pub(crate) async fn publish(&self, dataset: &str, snapshot: TableSnapshot) -> PondResult<()> {
        let kind = snapshot.kind();
        let version = snapshot.version();
        self.register_view(dataset, snapshot).await?;
        self.catalog
            .record_snapshot(dataset, kind, version)
            .await
            .context(CatalogSnafu)
    }

    /// Register `snapshot` as the view of its table, replacing any previous
    /// registration.
    pub(crate) async fn register_view(
        &self,
        dataset: &str,
        snapshot: TableSnapshot,
    ) -> PondResult<()> {
        let kind = snapshot.kind();
        let version = snapshot.version();
        let view = view_name(dataset, kind);
        let provider = Arc::new(LakeTableProvider::new(snapshot));
        let plan = LogicalPlanBuilder::scan(
            TableReference::bare(format!("{dataset}.{}", kind.name())),
            provider_as_source(provider),
            None,
        )
        .and_then(LogicalPlanBuilder::build)
        .context(ViewSnafu { view: view.as_str() })?;

        let ctx = self.connection.acquire().await.context(EngineInitSnafu)?;
        let reference = TableReference::bare(view.as_str());
        ctx.deregister_table(reference.clone())
            .context(ViewSnafu { view: view.as_str() })?;
        ctx.register_table(reference, Arc::new(ViewTable::new(plan, None)))
            .context(ViewSnafu { view: view.as_str() })?;
        log::debug!("view {view} now reads version {version}");
        Ok(())
    }

    /// Open one table of a ready dataset.
    pub(crate) async fn open_table(&self, dataset: &str, kind: TableKind) -> PondResult<LakeTable> {
        let location = self.catalog.table_location(dataset, kind);
        match LakeTable::open(location, kind).await {
            Ok(table) => Ok(table),
            Err(TableError::NotFound { .. }) => DatasetInconsistentSnafu {
                dataset,
                reason: format!("{kind} table is missing from storage"),
            }
            .fail(),
            Err(source) => Err(PondError::Table {
                dataset: dataset.to_string(),
                kind,
                source,
            }),
        }
    }

    /// Report datasets in a state that needs an operator. Nothing is fixed.
    pub async fn reconcile(&self) -> PondResult<Vec<Finding>> {
        let mut findings = Vec::new();
        let mut report = |dataset: &str, issue: Inconsistency| {
            log::warn!("dataset {dataset}: {issue}");
            findings.push(Finding {
                dataset: dataset.to_string(),
                issue,
            });
        };

        for (name, entry) in self.catalog.datasets().await {
            match entry.state {
                DatasetState::Initializing => report(&name, Inconsistency::Initializing),
                DatasetState::Removing => report(&name, Inconsistency::Removing),
                DatasetState::Ready => {
                    let present = self.stored_tables(&name).await?;
                    for kind in TableKind::ALL {
                        if !present.contains(&kind) {
                            report(&name, Inconsistency::MissingTable(kind));
                        } else if !self.view_registered(&name, kind).await? {
                            report(&name, Inconsistency::MissingView(kind));
                        }
                    }
                }
            }
        }

        for name in self.catalog.discover_stored_datasets().await.context(CatalogSnafu)? {
            if self.catalog.dataset(&name).await.is_some() {
                continue;
            }
            let present = self.stored_tables(&name).await?;
            if present.len() != TableKind::ALL.len() {
                report(&name, Inconsistency::PartialUntracked { present });
            }
        }

        Ok(findings)
    }

    async fn views_registered(&self, dataset: &str) -> PondResult<bool> {
        for kind in TableKind::ALL {
            if !self.view_registered(dataset, kind).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn view_registered(&self, dataset: &str, kind: TableKind) -> PondResult<bool> {
        let view = view_name(dataset, kind);
        let ctx = self.connection.acquire().await.context(EngineInitSnafu)?;
        ctx.table_exist(TableReference::bare(view.as_str()))
            .context(ViewSnafu { view })
    }

    async fn stored_tables(&self, dataset: &str) -> PondResult<Vec<TableKind>> {
        let mut present = Vec::new();
        for kind in TableKind::ALL {
            let exists = LakeTable::exists(&self.catalog.table_location(dataset, kind))
                .await
                .context(TableSnafu { dataset, kind })?;
            if exists {
                present.push(kind);
            }
        }
        Ok(present)
    }

    async fn create_tables(&self, dataset: &str) -> PondResult<Vec<(TableKind, u64)>> {
        let mut versions = Vec::new();
        for kind in TableKind::ALL {
            let location = self.catalog.table_location(dataset, kind);
            let table = LakeTable::open_or_create(location, kind, dataset)
                .await
                .context(TableSnafu { dataset, kind })?;
            versions.push((kind, table.version()));
        }
        Ok(versions)
    }

    async fn open_tables(&self, dataset: &str) -> PondResult<Vec<(TableKind, u64)>> {
        let mut versions = Vec::new();
        for kind in TableKind::ALL {
            versions.push((kind, self.open_table(dataset, kind).await?.version()));
        }
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divelake_core::config::WarehouseConfig;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    async fn manager(tmp: &TempDir) -> Result<DatasetManager, Box<dyn std::error::Error>> {
        let config = WarehouseConfig::local(tmp.path())?;
        let catalog = Arc::new(CatalogManager::open(&config).await?);
        let connection = Arc::new(AnalyticsConnection::open(&config, catalog.warehouse())?);
        Ok(DatasetManager::new(catalog, connection))
    }

    #[test]
    fn view_names_follow_the_table_kind() {
        assert_eq!(view_name("seals", TableKind::Data), "seals_Data");
        assert_eq!(view_name("seals", TableKind::Events), "seals_Events");
    }

    #[tokio::test]
    async fn initialization_is_idempotent() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;

        m.ensure_dataset_initialized("seals").await?;
        m.ensure_dataset_initialized("seals").await?;

        assert_eq!(m.get_all_datasets().await?, vec!["seals".to_string()]);
        assert!(m.dataset_exists("seals").await?);
        let entry = m.catalog().dataset("seals").await.ok_or("missing entry")?;
        assert_eq!(entry.tables.len(), 2);
        assert!(m.reconcile().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;
        let err = m.require_ready("ghost").await.err().ok_or("expected an error")?;
        assert!(matches!(err, PondError::DatasetNotFound { .. }));
        assert!(!m.dataset_exists("ghost").await?);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;
        let err = m
            .ensure_dataset_initialized("../escape")
            .await
            .err()
            .ok_or("expected an error")?;
        assert_eq!(err.kind(), crate::ErrorKind::Query);
        Ok(())
    }

    #[tokio::test]
    async fn remove_drops_tables_views_and_entry() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;
        m.ensure_dataset_initialized("seals").await?;

        m.remove_dataset("seals").await?;

        assert!(m.get_all_datasets().await?.is_empty());
        assert!(m.catalog().dataset("seals").await.is_none());
        assert!(!tmp.path().join("seals.db").exists());
        assert!(matches!(
            m.remove_dataset("seals").await,
            Err(PondError::DatasetNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn restart_registers_existing_and_adopts_untracked() -> TestResult {
        let tmp = TempDir::new()?;
        {
            let m = manager(&tmp).await?;
            m.ensure_dataset_initialized("seals").await?;
        }
        // A dataset written by another tool: both tables, no catalog entry.
        for kind in TableKind::ALL {
            let location = divelake_core::storage::StorageLocation::local(
                tmp.path().join("whales.db").join(kind.name()),
            );
            LakeTable::create(location, kind, "whales").await?;
        }

        let m = manager(&tmp).await?;
        assert!(m.get_all_datasets().await?.is_empty());
        let loaded = m.load_existing().await?;
        assert_eq!(loaded, vec!["seals".to_string(), "whales".to_string()]);
        assert_eq!(m.get_all_datasets().await?, loaded);
        Ok(())
    }

    #[tokio::test]
    async fn half_present_datasets_are_reported_not_fixed() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;
        m.ensure_dataset_initialized("seals").await?;

        // Events table vanished behind the catalog's back.
        std::fs::remove_dir_all(tmp.path().join("seals.db").join("events"))?;
        // Untracked directory holding only a data table.
        LakeTable::create(
            divelake_core::storage::StorageLocation::local(tmp.path().join("orphan.db/data")),
            TableKind::Data,
            "orphan",
        )
        .await?;

        let findings = m.reconcile().await?;
        assert!(findings.contains(&Finding {
            dataset: "seals".to_string(),
            issue: Inconsistency::MissingTable(TableKind::Events),
        }));
        assert!(findings.contains(&Finding {
            dataset: "orphan".to_string(),
            issue: Inconsistency::PartialUntracked {
                present: vec![TableKind::Data],
            },
        }));

        // Reporting changed nothing.
        assert_eq!(m.reconcile().await?.len(), findings.len());
        assert!(m.catalog().dataset("orphan").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn interrupted_removal_surfaces_as_inconsistent() -> TestResult {
        let tmp = TempDir::new()?;
        let m = manager(&tmp).await?;
        m.ensure_dataset_initialized("seals").await?;
        m.catalog().mark_removing("seals").await?;

        let err = m.require_ready("seals").await.err().ok_or("expected an error")?;
        assert_eq!(err.kind(), crate::ErrorKind::DatasetInconsistent);
        let err = m
            .ensure_dataset_initialized("seals")
            .await
            .err()
            .ok_or("expected an error")?;
        assert_eq!(err.kind(), crate::ErrorKind::DatasetInconsistent);
        assert_eq!(
            m.reconcile().await?,
            vec![Finding {
                dataset: "seals".to_string(),
                issue: Inconsistency::Removing,
            }]
        );
        Ok(())
    }
}
