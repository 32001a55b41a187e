use std::sync::Arc;

use arrow::{
    array::{ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray},
    datatypes::{DataType, Field, Schema},
    error::ArrowError,
};

use crate::lake_table::schema::{UTC, timestamp_type};

/// Build a minimal `data` batch of double readings for dataset `ds`,
/// deployment `d1`, class `sensor`.
///
/// Rows are `(animal, label, epoch_seconds, value)`.
pub(crate) fn signal_batch(rows: &[(&str, &str, i64, f64)]) -> Result<RecordBatch, ArrowError> {
    let n = rows.len();
    let schema = Arc::new(Schema::new(vec![
        Field::new("dataset", DataType::Utf8, false),
        Field::new("animal", DataType::Utf8, false),
        Field::new("deployment", DataType::Utf8, false),
        Field::new("class", DataType::Utf8, false),
        Field::new("label", DataType::Utf8, false),
        Field::new("datetime", timestamp_type(), false),
        Field::new("val_dbl", DataType::Float64, true),
        Field::new("data_type", DataType::Utf8, false),
    ]));

    let constant = |v: &str| Arc::new(StringArray::from(vec![v; n])) as ArrayRef;
    RecordBatch::try_new(
        schema,
        vec![
            constant("ds"),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0))),
            constant("d1"),
            constant("sensor"),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(rows.iter().map(|r| r.2 * 1_000_000))
                    .with_timezone(UTC),
            ),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.3))),
            constant("double"),
        ],
    )
}

/// Build a minimal `events` batch for dataset `ds`, deployment `d1`.
///
/// Rows are `(animal, event_key, start_seconds, end_seconds)`.
pub(crate) fn events_batch(
    rows: &[(&str, &str, i64, Option<i64>)],
) -> Result<RecordBatch, ArrowError> {
    let n = rows.len();
    let schema = Arc::new(Schema::new(vec![
        Field::new("dataset", DataType::Utf8, false),
        Field::new("animal", DataType::Utf8, false),
        Field::new("deployment", DataType::Utf8, false),
        Field::new("event_key", DataType::Utf8, false),
        Field::new("datetime_start", timestamp_type(), false),
        Field::new("datetime_end", timestamp_type(), true),
        Field::new("event_data", DataType::Utf8, false),
    ]));

    let constant = |v: &str| Arc::new(StringArray::from(vec![v; n])) as ArrayRef;
    RecordBatch::try_new(
        schema,
        vec![
            constant("ds"),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0))),
            constant("d1"),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.1))),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(rows.iter().map(|r| r.2 * 1_000_000))
                    .with_timezone(UTC),
            ),
            Arc::new(
                TimestampMicrosecondArray::from(
                    rows.iter()
                        .map(|r| r.3.map(|s| s * 1_000_000))
                        .collect::<Vec<_>>(),
                )
                .with_timezone(UTC),
            ),
            constant("{}"),
        ],
    )
}
