use arrow::error::ArrowError;
use divelake_core::config::ConfigError;
use divelake_pond::{PondError, metadata::MetadataError};
use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Invalid warehouse configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Failed to load metadata from {path}: {source}"))]
    LoadMetadata {
        path: String,
        source: MetadataError,
    },

    #[snafu(display("{source}"))]
    Pond {
        #[snafu(source(from(PondError, Box::new)))]
        source: Box<PondError>,
    },

    #[snafu(display("Arrow error: {source}"))]
    Arrow { source: ArrowError },

    #[snafu(display("Cannot access {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write output: {source}"))]
    WriteOutput { source: std::io::Error },

    #[snafu(display("Failed to encode JSON output: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("CSV file {path} has no {column:?} column"))]
    MissingCsvColumn { path: String, column: &'static str },

    #[snafu(display("CSV file {path}, row {row}: cannot parse datetime {value:?}"))]
    InvalidDatetime {
        path: String,
        row: usize,
        value: String,
    },

    #[snafu(display("CSV file {path}, row {row}: empty {column:?}"))]
    EmptyCsvValue {
        path: String,
        row: usize,
        column: &'static str,
    },

    #[snafu(display(
        "CSV output does not support column '{field}' of type {data_type}. \
         Use --format jsonl instead."
    ))]
    CsvUnsupportedType { field: String, data_type: String },
}
