//! Splitting a conformed batch into partition files and encoding them.

use std::collections::BTreeMap;

use arrow::{
    array::{AsArray, RecordBatch, UInt32Array},
    compute::{self, take_record_batch},
    datatypes::TimestampMicrosecondType,
};
use chrono::{DateTime, Utc};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};
use snafu::prelude::*;

use crate::lake_table::error::{ArrowSnafu, ParquetSnafu, SchemaMismatchSnafu, TableResult};
use crate::transaction_log::TableKind;

/// Rows of one batch sharing the same partition values.
#[derive(Debug)]
pub(crate) struct PartitionSlice {
    /// `(column, value)` pairs in partition order.
    pub(crate) values: Vec<(String, String)>,
    /// The rows, in their original relative order.
    pub(crate) batch: RecordBatch,
}

/// Group rows of `batch` by the partition columns of `kind`.
///
/// Slices are returned in ascending partition-value order; within a slice the
/// input row order is preserved.
pub(crate) fn split_by_partition(
    kind: TableKind,
    batch: &RecordBatch,
) -> TableResult<Vec<PartitionSlice>> {
    let columns = kind.partition_columns();
    let arrays = columns
        .iter()
        .map(|name| {
            batch
                .column_by_name(name)
                .map(|c| c.as_string::<i32>())
                .context(SchemaMismatchSnafu {
                    kind,
                    detail: format!("missing partition column {name:?}"),
                })
        })
        .collect::<TableResult<Vec<_>>>()?;

    let mut groups: BTreeMap<Vec<&str>, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key: Vec<&str> = arrays.iter().map(|a| a.value(row)).collect();
        groups.entry(key).or_default().push(row as u32);
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let indices = UInt32Array::from(rows);
            let slice = take_record_batch(batch, &indices).context(ArrowSnafu)?;
            let values = columns
                .iter()
                .zip(key)
                .map(|(c, v)| (c.to_string(), v.to_string()))
                .collect();
            Ok(PartitionSlice {
                values,
                batch: slice,
            })
        })
        .collect()
}

/// Closed `[min, max]` interval of the time column of `kind` in `batch`.
pub(crate) fn time_bounds(
    kind: TableKind,
    batch: &RecordBatch,
) -> TableResult<(DateTime<Utc>, DateTime<Utc>)> {
    let column = batch
        .column_by_name(kind.time_column())
        .context(SchemaMismatchSnafu {
            kind,
            detail: format!("missing time column {:?}", kind.time_column()),
        })?;
    let micros = column.as_primitive::<TimestampMicrosecondType>();

    let min = compute::min(micros);
    let max = compute::max(micros);
    match (min, max) {
        (Some(min), Some(max)) => Ok((micros_to_utc(min), micros_to_utc(max))),
        _ => SchemaMismatchSnafu {
            kind,
            detail: "cannot compute time bounds of an empty slice".to_string(),
        }
        .fail(),
    }
}

fn micros_to_utc(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Encode `batch` as a standalone Parquet file.
pub(crate) fn encode_parquet(path: &str, batch: &RecordBatch) -> TableResult<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .context(ParquetSnafu { path })?;
    writer.write(batch).context(ParquetSnafu { path })?;
    writer.close().context(ParquetSnafu { path })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lake_table::test_util::signal_batch;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn split_groups_rows_by_partition_values() -> TestResult {
        let batch = signal_batch(&[
            ("a1", "depth", 0, 1.0),
            ("a2", "depth", 1, 2.0),
            ("a1", "temp", 2, 3.0),
            ("a1", "depth", 3, 4.0),
        ])?;

        let slices = split_by_partition(TableKind::Data, &batch)?;
        assert_eq!(slices.len(), 3);

        let first = &slices[0];
        assert_eq!(
            first.values,
            vec![
                ("animal".to_string(), "a1".to_string()),
                ("deployment".to_string(), "d1".to_string()),
                ("class".to_string(), "sensor".to_string()),
                ("label".to_string(), "depth".to_string()),
            ]
        );
        assert_eq!(first.batch.num_rows(), 2);

        let (min, max) = time_bounds(TableKind::Data, &first.batch)?;
        assert_eq!(min.timestamp(), 0);
        assert_eq!(max.timestamp(), 3);
        Ok(())
    }

    #[test]
    fn encode_parquet_writes_magic_bytes() -> TestResult {
        let batch = signal_batch(&[("a1", "depth", 0, 1.0)])?;
        let bytes = encode_parquet("x.parquet", &batch)?;
        assert_eq!(&bytes[..4], b"PAR1");
        assert_eq!(&bytes[bytes.len() - 4..], b"PAR1");
        Ok(())
    }
}
