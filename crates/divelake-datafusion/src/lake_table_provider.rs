use std::any::Any;
use std::sync::Arc;

use std::path::Path;

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use datafusion::catalog::Session;
use datafusion::catalog::TableProvider;
use datafusion::common::{DFSchema, project_schema};
use datafusion::datasource::TableType;
use datafusion::datasource::listing::PartitionedFile;
use datafusion::datasource::physical_plan::{FileScanConfigBuilder, ParquetSource};
use datafusion::datasource::source::DataSourceExec;
use datafusion::error::{DataFusionError, Result as DFResult};
use datafusion::execution::object_store::ObjectStoreUrl;
use datafusion::logical_expr::utils::conjunction;
use datafusion::logical_expr::{Expr, TableProviderFilterPushDown};
use datafusion::physical_plan::ExecutionPlan;
use datafusion::physical_plan::empty::EmptyExec;
use divelake_core::lake_table::TableSnapshot;
use divelake_core::storage;
use divelake_core::transaction_log::DataFile;

mod pruning;
mod time_predicate;


/// DataFusion table provider over one pinned version of a lake table.
///
/// The provider never observes commits made after it was built: re-register
/// a provider over a newer [`TableSnapshot`] to see them. Filters are pushed
/// down as `Inexact`; they prune whole files using partition values and time
/// bounds from the commit log, and DataFusion re-applies them row by row.
///
/// Surviving files are read by a Parquet scan through the session's object
/// store registry, so only projected columns are decoded and row groups are
/// pruned by the same filters. Remote warehouses need their bucket store
/// registered with the session; local ones use the built-in `file://` store.
#[derive(Debug, Clone)]
pub struct LakeTableProvider {
    snapshot: TableSnapshot,
}

impl LakeTableProvider {
    /// Wrap a table snapshot.
    pub fn new(snapshot: TableSnapshot) -> Self {
        Self { snapshot }
    }

    /// The pinned snapshot.
    pub fn snapshot(&self) -> &TableSnapshot {
        &self.snapshot
    }

    /// Files that survive pruning by `filters`, in commit order.
    ///
    /// Each file becomes one scan partition in this order, so reading the
    /// partitions one after the other yields rows in the order they were
    /// written.
    pub fn candidate_files(&self, filters: &[Expr]) -> Vec<&DataFile> {
        let mut files = pruning::prune_files(
            self.snapshot.kind(),
            self.snapshot.state().data_files(),
            filters,
        );
        files.sort_by(|a, b| commit_order(a).cmp(&commit_order(b)));
        files
    }
}

#[async_trait]
impl TableProvider for LakeTableProvider {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.snapshot.schema()
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    fn supports_filters_pushdown(
        &self,
        filters: &[&Expr],
    ) -> DFResult<Vec<TableProviderFilterPushDown>> {
        Ok(vec![TableProviderFilterPushDown::Inexact; filters.len()])
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let total = self.snapshot.state().files.len();
        let files = self.candidate_files(filters);
        log::debug!(
            "scanning {} of {total} files of {} table version {}",
            files.len(),
            self.snapshot.kind(),
            self.snapshot.version()
        );

        if files.is_empty() {
            let schema = project_schema(&self.schema(), projection)?;
            return Ok(Arc::new(EmptyExec::new(schema)));
        }

        let location = self.snapshot.location();
        let mut store_url = String::new();
        let mut partitioned = Vec::with_capacity(files.len());
        for file in files {
            let (url, key) = storage::object_location(location, Path::new(&file.path))
                .map_err(|e| DataFusionError::External(Box::new(e)))?;
            store_url = url;
            let mut scanned = PartitionedFile::new(String::new(), file.file_size);
            scanned.object_meta.location = key;
            partitioned.push(scanned);
        }
        let store_url = ObjectStoreUrl::parse(store_url)?;

        let mut source = ParquetSource::default();
        if let Some(predicate) = conjunction(filters.iter().cloned()) {
            let df_schema = DFSchema::try_from(self.schema().as_ref().clone())?;
            source = source.with_predicate(state.create_physical_expr(predicate, &df_schema)?);
        }

        let mut builder = FileScanConfigBuilder::new(store_url, self.schema(), Arc::new(source))
            .with_projection_indices(projection.cloned())
            .with_limit(limit);
        for file in partitioned {
            builder = builder.with_file(file);
        }
        let exec: Arc<dyn ExecutionPlan> = DataSourceExec::from_data_source(builder.build());
        Ok(exec)
    }
}

/// Data file names are `part-<version>-<seq>.parquet` with fixed-width
/// numbers, so they sort by commit version then write sequence.
fn commit_order(file: &DataFile) -> (&str, &str) {
    let name = file.path.rsplit('/').next().unwrap_or(&file.path);
    (name, file.path.as_str())
}
