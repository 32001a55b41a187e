//! Long-to-wide reshaping of signal results.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    array::{ArrayRef, Float64Array, RecordBatch, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
};
use divelake_core::lake_table::{UTC, timestamp_type};

use crate::series::{DATETIME, LabelSeries};

/// Reshape per-label series into one row per distinct timestamp.
///
/// The result has a `datetime` column followed by one nullable `Float64`
/// column per label, in the order of `series`. A label without a reading at
/// a timestamp gets a null in that row. When a label has several readings at
/// the same timestamp the last one wins.
pub fn pivot(series: &[LabelSeries]) -> Result<RecordBatch, ArrowError> {
    let width = series.len();
    let mut rows: BTreeMap<i64, Vec<Option<f64>>> = BTreeMap::new();
    for (column, s) in series.iter().enumerate() {
        for (time, value) in s.times.iter().zip(&s.values) {
            rows.entry(*time).or_insert_with(|| vec![None; width])[column] = *value;
        }
    }

    let mut fields = Vec::with_capacity(width + 1);
    fields.push(Field::new(DATETIME, timestamp_type(), false));
    fields.extend(
        series
            .iter()
            .map(|s| Field::new(s.label.as_str(), DataType::Float64, true)),
    );

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(width + 1);
    columns.push(Arc::new(
        TimestampMicrosecondArray::from_iter_values(rows.keys().copied()).with_timezone(UTC),
    ));
    for column in 0..width {
        columns.push(Arc::new(Float64Array::from_iter(
            rows.values().map(|row| row[column]),
        )));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}
