//! Fixed Arrow schemas of the two physical tables and write-time conformance.
//!
//! Signal rows use a wide layout: exactly one of `val_dbl`, `val_int`,
//! `val_bool`, `val_str` is populated per row, tagged by `data_type`.
//! [`conform_batch`] reorders incoming columns by name, widens compatible
//! types (timestamp units and zones, 32-bit numbers, string views) and
//! enforces that tagging invariant before anything is written.

use std::sync::{Arc, LazyLock};

use arrow::{
    array::{Array, ArrayRef, AsArray, RecordBatch, new_null_array},
    compute::cast,
    datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit},
};
use snafu::prelude::*;

use crate::lake_table::error::{ArrowSnafu, SchemaMismatchSnafu, TableResult};
use crate::transaction_log::TableKind;

/// Time zone attached to every timestamp column.
pub const UTC: &str = "UTC";

/// Arrow type of every timestamp column: microseconds, UTC.
pub fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into()))
}

static DATA_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("dataset", DataType::Utf8, false),
        Field::new("animal", DataType::Utf8, false),
        Field::new("deployment", DataType::Utf8, false),
        Field::new("recording", DataType::Utf8, true),
        Field::new("group", DataType::Utf8, true),
        Field::new("class", DataType::Utf8, false),
        Field::new("label", DataType::Utf8, false),
        Field::new("datetime", timestamp_type(), false),
        Field::new("val_dbl", DataType::Float64, true),
        Field::new("val_int", DataType::Int64, true),
        Field::new("val_bool", DataType::Boolean, true),
        Field::new("val_str", DataType::Utf8, true),
        Field::new("data_type", DataType::Utf8, false),
    ]))
});

static EVENTS_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("dataset", DataType::Utf8, false),
        Field::new("animal", DataType::Utf8, false),
        Field::new("deployment", DataType::Utf8, false),
        Field::new("recording", DataType::Utf8, true),
        Field::new("group", DataType::Utf8, true),
        Field::new("event_key", DataType::Utf8, false),
        Field::new("datetime_start", timestamp_type(), false),
        Field::new("datetime_end", timestamp_type(), true),
        Field::new("short_description", DataType::Utf8, true),
        Field::new("long_description", DataType::Utf8, true),
        Field::new("event_data", DataType::Utf8, false),
    ]))
});

/// Schema of a dataset's `data` table.
pub fn data_schema() -> SchemaRef {
    Arc::clone(&DATA_SCHEMA)
}

/// Schema of a dataset's `events` table.
pub fn events_schema() -> SchemaRef {
    Arc::clone(&EVENTS_SCHEMA)
}

/// Schema for a table kind.
pub fn table_schema(kind: TableKind) -> SchemaRef {
    match kind {
        TableKind::Data => data_schema(),
        TableKind::Events => events_schema(),
    }
}

/// Runtime type of a signal value, stored in the `data_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    /// `val_dbl` populated.
    Double,
    /// `val_int` populated.
    Int,
    /// `val_bool` populated.
    Bool,
    /// `val_str` populated.
    Str,
}

impl SignalType {
    /// Tag written into `data_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Double => "double",
            SignalType::Int => "int",
            SignalType::Bool => "bool",
            SignalType::Str => "str",
        }
    }

    /// Parse a `data_type` tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "double" => Some(SignalType::Double),
            "int" => Some(SignalType::Int),
            "bool" => Some(SignalType::Bool),
            "str" => Some(SignalType::Str),
            _ => None,
        }
    }

    /// Name of the value column this type populates.
    pub fn value_column(self) -> &'static str {
        match self {
            SignalType::Double => "val_dbl",
            SignalType::Int => "val_int",
            SignalType::Bool => "val_bool",
            SignalType::Str => "val_str",
        }
    }
}

const VALUE_COLUMNS: [&str; 4] = ["val_dbl", "val_int", "val_bool", "val_str"];

fn widen(kind: TableKind, field: &Field, array: &ArrayRef) -> TableResult<ArrayRef> {
    let target = field.data_type();
    let source = array.data_type();
    if source == target {
        return Ok(Arc::clone(array));
    }

    let castable = matches!(
        (source, target),
        (DataType::Timestamp(_, _), DataType::Timestamp(_, _))
            | (DataType::LargeUtf8 | DataType::Utf8View, DataType::Utf8)
            | (DataType::Int8 | DataType::Int16 | DataType::Int32, DataType::Int64)
            | (DataType::UInt8 | DataType::UInt16 | DataType::UInt32, DataType::Int64)
            | (DataType::Float16 | DataType::Float32, DataType::Float64)
            | (DataType::Null, _)
    );
    ensure!(
        castable,
        SchemaMismatchSnafu {
            kind,
            detail: format!(
                "column {:?} has type {source}, expected {target}",
                field.name()
            ),
        }
    );

    cast(array, target).context(ArrowSnafu)
}

/// Reorder and widen `batch` to the fixed schema of `kind`.
///
/// Missing nullable columns are filled with nulls. Missing required columns,
/// unexpected extra columns, nulls in required columns and incompatible types
/// are all rejected. For `data` batches the value-tagging invariant is checked
/// row by row.
pub fn conform_batch(kind: TableKind, batch: &RecordBatch) -> TableResult<RecordBatch> {
    let schema = table_schema(kind);
    let input_schema = batch.schema();

    for field in input_schema.fields() {
        ensure!(
            schema.index_of(field.name()).is_ok(),
            SchemaMismatchSnafu {
                kind,
                detail: format!("unexpected column {:?}", field.name()),
            }
        );
    }

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column = match input_schema.index_of(field.name()) {
            Ok(idx) => widen(kind, field, batch.column(idx))?,
            Err(_) if field.is_nullable() => new_null_array(field.data_type(), batch.num_rows()),
            Err(_) => {
                return SchemaMismatchSnafu {
                    kind,
                    detail: format!("missing required column {:?}", field.name()),
                }
                .fail();
            }
        };

        ensure!(
            field.is_nullable() || column.null_count() == 0,
            SchemaMismatchSnafu {
                kind,
                detail: format!("required column {:?} contains nulls", field.name()),
            }
        );
        columns.push(column);
    }

    let conformed = RecordBatch::try_new(schema, columns).context(ArrowSnafu)?;
    if kind == TableKind::Data {
        check_value_tagging(&conformed)?;
    }
    Ok(conformed)
}

/// Every `data` row must populate exactly the value column named by its
/// `data_type` tag.
fn check_value_tagging(batch: &RecordBatch) -> TableResult<()> {
    let kind = TableKind::Data;
    let tags = batch
        .column_by_name("data_type")
        .map(|c| c.as_string::<i32>())
        .context(SchemaMismatchSnafu {
            kind,
            detail: "missing data_type column".to_string(),
        })?;

    let value_columns: Vec<(&str, &ArrayRef)> = VALUE_COLUMNS
        .iter()
        .filter_map(|name| batch.column_by_name(name).map(|c| (*name, c)))
        .collect();

    for row in 0..batch.num_rows() {
        let tag = tags.value(row);
        let signal_type = SignalType::parse(tag).context(SchemaMismatchSnafu {
            kind,
            detail: format!("row {row}: unknown data_type {tag:?}"),
        })?;

        for (name, column) in &value_columns {
            let expected_populated = *name == signal_type.value_column();
            let populated = column.is_valid(row);
            ensure!(
                populated == expected_populated,
                SchemaMismatchSnafu {
                    kind,
                    detail: if expected_populated {
                        format!("row {row}: data_type {tag:?} but {name} is null")
                    } else {
                        format!("row {row}: data_type {tag:?} but {name} is also populated")
                    },
                }
            );
        }
    }
    Ok(())
}
