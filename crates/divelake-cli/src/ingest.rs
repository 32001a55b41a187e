//! Long-format CSV ingestion.
//!
//! The file needs a header with at least `datetime`, `label` and `value`
//! columns; `group` and `class` are optional. Every row is one reading.
//! Rows are grouped per `(group, class, label)` and each group is written
//! as one channel.

use std::{collections::BTreeMap, fs::File, io::Seek, path::Path, sync::Arc};

use arrow::{
    array::{Array, AsArray, StringArray},
    datatypes::{DataType, Field, Schema},
};
use arrow_csv::{ReaderBuilder, reader::Format};
use chrono::{DateTime, NaiveDateTime, Utc};
use divelake_pond::{DivePond, SignalMetadata, SignalValue};
use snafu::{OptionExt, ResultExt};

use crate::error::{
    ArrowSnafu, CliResult, EmptyCsvValueSnafu, InvalidDatetimeSnafu, IoSnafu,
    MissingCsvColumnSnafu, PondSnafu,
};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Readings of one channel, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRows {
    pub group: Option<String>,
    pub class: String,
    pub label: String,
    pub times: Vec<DateTime<Utc>>,
    pub values: Vec<SignalValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub channels: usize,
    pub rows: u64,
}

/// Integers, then floats, then booleans; anything else is kept as text.
pub fn parse_value(raw: &str) -> SignalValue {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<i64>() {
        return SignalValue::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return SignalValue::Double(v);
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => SignalValue::Bool(true),
        "false" => SignalValue::Bool(false),
        _ => SignalValue::Str(raw.to_string()),
    }
}

/// RFC 3339, a naive timestamp taken as UTC, or epoch seconds.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    raw.parse::<f64>()
        .ok()
        .filter(|s| s.is_finite())
        .and_then(|s| DateTime::from_timestamp_micros((s * 1_000_000.0).round() as i64))
}

fn column<'a>(
    batch: &'a arrow::array::RecordBatch,
    name: &'static str,
    path: &Path,
) -> CliResult<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_string_opt::<i32>())
        .context(MissingCsvColumnSnafu {
            path: path.display().to_string(),
            column: name,
        })
}

fn optional_value(array: Option<&StringArray>, row: usize) -> Option<String> {
    array
        .filter(|a| a.is_valid(row))
        .map(|a| a.value(row).trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Read `path` and group its rows per channel.
///
/// Rows without a `class` get `default_class`.
pub fn read_channels(path: &Path, default_class: &str) -> CliResult<Vec<ChannelRows>> {
    let display = path.display().to_string();
    let mut file = File::open(path).context(IoSnafu {
        path: display.clone(),
    })?;

    let (header, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut file, Some(0))
        .context(ArrowSnafu)?;
    file.rewind().context(IoSnafu {
        path: display.clone(),
    })?;
    let schema = Schema::new(
        header
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    );

    let reader = ReaderBuilder::new(Arc::new(schema))
        .with_header(true)
        .build(file)
        .context(ArrowSnafu)?;

    let mut channels: BTreeMap<(Option<String>, String, String), ChannelRows> = BTreeMap::new();
    let mut row_offset = 0;
    for batch in reader {
        let batch = batch.context(ArrowSnafu)?;
        let datetimes = column(&batch, "datetime", path)?;
        let labels = column(&batch, "label", path)?;
        let values = column(&batch, "value", path)?;
        let groups = column(&batch, "group", path).ok();
        let classes = column(&batch, "class", path).ok();

        for idx in 0..batch.num_rows() {
            let row = row_offset + idx + 1;
            let label = optional_value(Some(labels), idx).context(EmptyCsvValueSnafu {
                path: display.as_str(),
                row,
                column: "label",
            })?;
            let raw_value = optional_value(Some(values), idx).context(EmptyCsvValueSnafu {
                path: display.as_str(),
                row,
                column: "value",
            })?;
            let raw_time = optional_value(Some(datetimes), idx).unwrap_or_default();
            let time = parse_datetime(&raw_time).context(InvalidDatetimeSnafu {
                path: display.as_str(),
                row,
                value: raw_time.as_str(),
            })?;
            let group = optional_value(groups, idx);
            let class = optional_value(classes, idx).unwrap_or_else(|| default_class.to_string());

            let entry = channels
                .entry((group.clone(), class.clone(), label.clone()))
                .or_insert_with(|| ChannelRows {
                    group,
                    class,
                    label,
                    times: Vec::new(),
                    values: Vec::new(),
                });
            entry.times.push(time);
            entry.values.push(parse_value(&raw_value));
        }
        row_offset += batch.num_rows();
    }

    Ok(channels.into_values().collect())
}

/// Write every channel of `path` into `dataset`.
pub async fn ingest_csv(
    pond: &DivePond,
    dataset: &str,
    path: &Path,
    metadata: &SignalMetadata,
    default_class: &str,
) -> CliResult<IngestSummary> {
    let channels = read_channels(path, default_class)?;
    let mut summary = IngestSummary::default();
    for channel in &channels {
        let rows = pond
            .write_signal_data(
                dataset,
                metadata,
                &channel.times,
                channel.group.as_deref(),
                &channel.class,
                &channel.label,
                &channel.values,
            )
            .await
            .context(PondSnafu)?;
        log::info!("ingested {rows} reading(s) of {} into {dataset}", channel.label);
        summary.channels += 1;
        summary.rows += rows;
    }
    Ok(summary)
}
