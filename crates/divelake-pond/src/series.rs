//! In-memory per-label series and the result batch helpers built on them.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{
        Array, ArrayRef, AsArray, Float64Array, RecordBatch, StringBuilder,
        TimestampMicrosecondArray,
    },
    compute::cast,
    datatypes::{DataType, Field, Float64Type, Schema, SchemaRef, TimestampMicrosecondType},
    error::ArrowError,
};
use divelake_core::lake_table::{UTC, timestamp_type};

/// Name of the time column of signal results.
pub const DATETIME: &str = "datetime";
/// Name of the label column of long-form signal results.
pub const LABEL: &str = "label";
/// Name of the value column of long-form signal results.
pub const NUMERIC_VALUE: &str = "numeric_value";

/// One label's readings, ascending by time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSeries {
    /// Channel label.
    pub label: String,
    /// Epoch microseconds, non-decreasing.
    pub times: Vec<i64>,
    /// Value at each time; `None` where the reading is not numeric or a
    /// forward-filled grid point precedes the first sample.
    pub values: Vec<Option<f64>>,
}

impl LabelSeries {
    /// Empty series for `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether the series holds no reading.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Schema of long-form signal results.
pub fn long_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(DATETIME, timestamp_type(), false),
        Field::new(LABEL, DataType::Utf8, false),
        Field::new(NUMERIC_VALUE, DataType::Float64, true),
    ]))
}

/// Group long-form batches (`datetime`, `label`, `numeric_value`) into one
/// series per label, in label order.
///
/// Each label's readings are sorted by time with a stable sort, so readings
/// sharing a timestamp keep the order they arrived in.
pub(crate) fn split_long(batches: &[RecordBatch]) -> Result<Vec<LabelSeries>, ArrowError> {
    let mut by_label: BTreeMap<String, LabelSeries> = BTreeMap::new();

    for batch in batches {
        let times = column(batch, DATETIME)?;
        let times = times
            .as_primitive_opt::<TimestampMicrosecondType>()
            .ok_or_else(|| type_error(DATETIME, times.data_type()))?;
        let labels = cast(column(batch, LABEL)?.as_ref(), &DataType::Utf8)?;
        let labels = labels.as_string::<i32>();
        let values = cast(column(batch, NUMERIC_VALUE)?.as_ref(), &DataType::Float64)?;
        let values = values.as_primitive::<Float64Type>();

        for row in 0..batch.num_rows() {
            if times.is_null(row) || labels.is_null(row) {
                continue;
            }
            let label = labels.value(row);
            if !by_label.contains_key(label) {
                by_label.insert(label.to_string(), LabelSeries::new(label));
            }
            if let Some(series) = by_label.get_mut(label) {
                series.times.push(times.value(row));
                series.values.push(values.is_valid(row).then(|| values.value(row)));
            }
        }
    }

    Ok(by_label.into_values().map(sort_by_time).collect())
}

fn sort_by_time(series: LabelSeries) -> LabelSeries {
    if series.times.is_sorted() {
        return series;
    }
    let LabelSeries {
        label,
        times,
        values,
    } = series;
    let mut readings: Vec<(i64, Option<f64>)> = times.into_iter().zip(values).collect();
    readings.sort_by_key(|r| r.0);
    let (times, values) = readings.into_iter().unzip();
    LabelSeries {
        label,
        times,
        values,
    }
}

/// Long-form batch of `series`, ordered by `(label, datetime)`.
pub(crate) fn long_batch(series: &[LabelSeries]) -> Result<RecordBatch, ArrowError> {
    let times = TimestampMicrosecondArray::from_iter_values(
        series.iter().flat_map(|s| s.times.iter().copied()),
    )
    .with_timezone(UTC);
    let total_len: usize = series.iter().map(LabelSeries::len).sum();
    let label_bytes: usize = series.iter().map(|s| s.label.len() * s.len()).sum();
    let mut labels = StringBuilder::with_capacity(total_len, label_bytes);
    for s in series {
        for _ in 0..s.len() {
            labels.append_value(&s.label);
        }
    }
    let labels = labels.finish();
    let values = Float64Array::from_iter(series.iter().flat_map(|s| s.values.iter().copied()));

    RecordBatch::try_new(
        long_schema(),
        vec![Arc::new(times), Arc::new(labels), Arc::new(values)],
    )
}

/// Shift every value of the named timestamp columns by `offset_micros`.
///
/// Columns that are absent are skipped; nulls stay null. A shift past the
/// representable range is a compute error.
pub(crate) fn shift_timestamps(
    batch: &RecordBatch,
    columns: &[&str],
    offset_micros: i64,
) -> Result<RecordBatch, ArrowError> {
    if offset_micros == 0 {
        return Ok(batch.clone());
    }
    let schema = batch.schema();
    let mut arrays = batch.columns().to_vec();
    for name in columns {
        let Ok(index) = schema.index_of(name) else {
            continue;
        };
        let times = arrays[index]
            .as_primitive_opt::<TimestampMicrosecondType>()
            .ok_or_else(|| type_error(name, arrays[index].data_type()))?;
        let shifted: TimestampMicrosecondArray = times.try_unary(|v| {
            v.checked_add(offset_micros).ok_or_else(|| {
                ArrowError::ComputeError(format!(
                    "shifting {name} by {offset_micros}us overflows at {v}"
                ))
            })
        })?;
        arrays[index] = Arc::new(shifted.with_timezone(UTC)) as ArrayRef;
    }
    RecordBatch::try_new(schema, arrays)
}

/// Append a `Float64` column of epoch seconds derived from the timestamp
/// column `source`.
pub(crate) fn with_epoch_seconds(
    batch: &RecordBatch,
    source: &str,
    name: &str,
) -> Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    let index = schema.index_of(source)?;
    let times = batch.column(index);
    let times = times
        .as_primitive_opt::<TimestampMicrosecondType>()
        .ok_or_else(|| type_error(source, times.data_type()))?;
    let seconds: Float64Array = times.unary(|v| v as f64 / 1_000_000.0);

    let mut fields = schema.fields().iter().cloned().collect::<Vec<_>>();
    let nullable = schema.field(index).is_nullable();
    fields.push(Arc::new(Field::new(name, DataType::Float64, nullable)));
    let mut arrays = batch.columns().to_vec();
    arrays.push(Arc::new(seconds));
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

/// First `limit` rows of `batch`.
pub(crate) fn truncate(batch: RecordBatch, limit: Option<usize>) -> RecordBatch {
    match limit {
        Some(limit) if limit < batch.num_rows() => batch.slice(0, limit),
        _ => batch,
    }
}

fn column(batch: &RecordBatch, name: &str) -> Result<ArrayRef, ArrowError> {
    let index = batch.schema().index_of(name)?;
    Ok(Arc::clone(batch.column(index)))
}

fn type_error(name: &str, data_type: &DataType) -> ArrowError {
    ArrowError::InvalidArgumentError(format!(
        "column {name} has type {data_type}, expected Timestamp(Microsecond, \"{UTC}\")"
    ))
}
