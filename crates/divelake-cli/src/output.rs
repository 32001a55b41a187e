//! Terminal rendering of results.
//!
//! Record batches print as a bounded preview table and can be written in
//! full to a CSV or JSON Lines file. Listings built from plain values
//! (datasets, deployments, channels) share the same table style.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use arrow::{
    array::RecordBatch,
    datatypes::{DataType, Schema},
    error::ArrowError,
    util::display::{ArrayFormatter, FormatOptions},
};
use serde::Serialize;
use snafu::ResultExt;
use tabled::{
    builder::Builder,
    settings::{Style, object::Rows, style::LineText, width::MinWidth},
};

use crate::error::{
    ArrowSnafu, CliResult, CsvUnsupportedTypeSnafu, IoSnafu, JsonSnafu, WriteOutputSnafu,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone)]
pub struct OutputOpts {
    pub max_rows: usize,
    pub output: Option<PathBuf>,
    pub format: OutputFormat,
}

pub fn render_table(title: &str, columns: &[String], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    const TITLE_OFFSET: usize = 2;
    let min_width = TITLE_OFFSET + title.len() + 4;

    let mut builder = Builder::default();
    builder.push_record(columns);
    for row in rows {
        builder.push_record(row);
    }

    let mut table = builder.build();
    table.with(Style::rounded());
    table.with(MinWidth::new(min_width));
    table.with(LineText::new(title, Rows::first()).offset(TITLE_OFFSET));
    // LineText re-estimates dimensions, so re-apply MinWidth afterwards.
    table.with(MinWidth::new(min_width));
    table.to_string()
}

fn column_names(schema: &Schema) -> Vec<String> {
    schema.fields().iter().map(|f| f.name().to_string()).collect()
}

/// First `max_rows` rows of `batch` as display strings.
fn preview_rows(batch: &RecordBatch, max_rows: usize) -> CliResult<Vec<Vec<String>>> {
    let options = FormatOptions::default().with_null("null");
    let formatters = batch
        .columns()
        .iter()
        .map(|col| ArrayFormatter::try_new(col.as_ref(), &options))
        .collect::<Result<Vec<_>, ArrowError>>()
        .context(ArrowSnafu)?;

    let rows_to_take = max_rows.min(batch.num_rows());
    let mut rows = Vec::with_capacity(rows_to_take);
    for row_idx in 0..rows_to_take {
        let mut row = Vec::with_capacity(formatters.len());
        for formatter in &formatters {
            row.push(formatter.value(row_idx).try_to_string().context(ArrowSnafu)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn ensure_csv_supported(schema: &Schema) -> CliResult<()> {
    for field in schema.fields() {
        let dt = field.data_type();
        let unsupported = matches!(
            dt,
            DataType::List(_)
                | DataType::LargeList(_)
                | DataType::FixedSizeList(_, _)
                | DataType::Struct(_)
                | DataType::Map(_, _)
                | DataType::Union(_, _)
        );

        if unsupported {
            return CsvUnsupportedTypeSnafu {
                field: field.name().to_string(),
                data_type: format!("{dt:?}"),
            }
            .fail();
        }
    }

    Ok(())
}

/// Write all of `batch` to `path`, replacing the file if it exists.
pub fn write_batch_file(batch: &RecordBatch, path: &Path, format: OutputFormat) -> CliResult<()> {
    if format == OutputFormat::Csv {
        ensure_csv_supported(batch.schema().as_ref())?;
    }

    let file = File::create(path).context(IoSnafu {
        path: path.display().to_string(),
    })?;
    let writer = BufWriter::new(file);

    let mut writer = match format {
        OutputFormat::Csv => {
            let mut w = arrow_csv::WriterBuilder::new().with_header(true).build(writer);
            w.write(batch).context(ArrowSnafu)?;
            w.into_inner()
        }
        OutputFormat::Jsonl => {
            let mut w = arrow_json::LineDelimitedWriter::new(writer);
            w.write_batches(&[batch]).context(ArrowSnafu)?;
            w.finish().context(ArrowSnafu)?;
            w.into_inner()
        }
    };
    writer.flush().context(WriteOutputSnafu)
}

/// Print a preview of `batch` under `title`, then a short summary.
pub fn emit_batch<W: Write>(
    title: &str,
    batch: &RecordBatch,
    opts: &OutputOpts,
    out: &mut W,
) -> CliResult<()> {
    if let Some(path) = &opts.output {
        write_batch_file(batch, path, opts.format)?;
    }

    let total_rows = batch.num_rows();
    if total_rows > 0 && opts.max_rows > 0 {
        let columns = column_names(batch.schema().as_ref());
        let rows = preview_rows(batch, opts.max_rows)?;
        writeln!(out, "{}", render_table(title, &columns, &rows)).context(WriteOutputSnafu)?;
    } else if total_rows > 0 {
        writeln!(out, "(preview suppressed; use --max-rows > 0)").context(WriteOutputSnafu)?;
    } else {
        writeln!(out, "(no rows)").context(WriteOutputSnafu)?;
    }

    writeln!(out, "total_rows: {total_rows}").context(WriteOutputSnafu)?;
    if let Some(path) = &opts.output {
        writeln!(out, "wrote: {} ({:?})", path.display(), opts.format)
            .context(WriteOutputSnafu)?;
    }
    Ok(())
}

/// Print a listing of plain rows.
pub fn emit_rows<W: Write>(
    title: &str,
    columns: &[&str],
    rows: &[Vec<String>],
    out: &mut W,
) -> CliResult<()> {
    if rows.is_empty() {
        return writeln!(out, "(no {title})").context(WriteOutputSnafu);
    }
    let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
    writeln!(out, "{}", render_table(title, &columns, rows)).context(WriteOutputSnafu)
}

/// Print `value` as pretty JSON.
pub fn emit_json<W: Write, T: Serialize + ?Sized>(value: &T, out: &mut W) -> CliResult<()> {
    let text = serde_json::to_string_pretty(value).context(JsonSnafu)?;
    writeln!(out, "{text}").context(WriteOutputSnafu)
}
