//! Reading committed data files back as Arrow batches.

use std::path::Path;

use arrow::array::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use snafu::prelude::*;

use crate::{
    lake_table::{
        error::{ArrowSnafu, ParquetSnafu, StorageSnafu, TableResult},
        schema::table_schema,
    },
    storage::{self, StorageLocation},
    transaction_log::{DataFile, TableKind},
};

/// Read every row of one data file.
///
/// Batches are re-wrapped with the canonical schema of `kind` so that field
/// metadata written by other Parquet producers does not leak into query plans.
pub(crate) async fn read_data_file(
    location: &StorageLocation,
    kind: TableKind,
    file: &DataFile,
) -> TableResult<Vec<RecordBatch>> {
    let bytes = storage::read_all_bytes(location, Path::new(&file.path))
        .await
        .context(StorageSnafu)?;

    let path = file.path.as_str();
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .context(ParquetSnafu { path })?
        .build()
        .context(ParquetSnafu { path })?;

    let schema = table_schema(kind);
    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        let batch =
            RecordBatch::try_new(schema.clone(), batch.columns().to_vec()).context(ArrowSnafu)?;
        batches.push(batch);
    }
    Ok(batches)
}
