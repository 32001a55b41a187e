//! Command-line access to a DiveLake warehouse.

mod error;
mod ingest;
mod output;

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use divelake_core::{config::WarehouseConfig, transaction_log::TableKind};
use divelake_pond::{
    ChannelCatalog, ChannelOptions, DataRequest, DateRange, DeploymentSummary, DivePond,
    EventsRequest, FilterValues, PondContext, SignalMetadata, StaticMetadata,
    channels::ChannelEntry,
};
use snafu::ResultExt;

use crate::{
    error::{CliResult, ConfigSnafu, LoadMetadataSnafu, PondSnafu, WriteOutputSnafu},
    output::{OutputFormat, OutputOpts, emit_batch, emit_json, emit_rows},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    Csv,
    Jsonl,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(v: OutputFormatArg) -> Self {
        match v {
            OutputFormatArg::Csv => OutputFormat::Csv,
            OutputFormatArg::Jsonl => OutputFormat::Jsonl,
        }
    }
}

/// Where the warehouse lives. Every flag falls back to its environment
/// variable.
#[derive(Debug, Args)]
struct WarehouseArgs {
    /// Local warehouse root (used when no object storage is configured)
    #[arg(long, env = "DIVELAKE_WAREHOUSE", global = true)]
    warehouse: Option<PathBuf>,

    #[arg(long = "s3-endpoint", env = "S3_ENDPOINT", global = true)]
    endpoint: Option<String>,

    #[arg(long = "s3-access-key", env = "S3_ACCESS_KEY", global = true, hide_env_values = true)]
    access_key: Option<String>,

    #[arg(long = "s3-secret-key", env = "S3_SECRET_KEY", global = true, hide_env_values = true)]
    secret_key: Option<String>,

    #[arg(long = "s3-bucket", env = "S3_BUCKET", global = true)]
    bucket: Option<String>,

    #[arg(long = "s3-region", env = "S3_REGION", global = true)]
    region: Option<String>,

    /// Catalog bookkeeping directory for object storage warehouses
    #[arg(long = "catalog-dir", env = "DIVELAKE_CATALOG_DIR", global = true)]
    catalog_dir: Option<PathBuf>,

    #[arg(long = "cache-dir", env = "DIVELAKE_CACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// JSON file with channel metadata and deployment timezone offsets
    #[arg(long, env = "DIVELAKE_METADATA", global = true)]
    metadata: Option<PathBuf>,
}

impl WarehouseArgs {
    fn config(&self) -> CliResult<WarehouseConfig> {
        let mut builder = WarehouseConfig::builder().ignore_env(true);
        if let Some(path) = &self.warehouse {
            builder = builder.local_path(path);
        }
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint(endpoint);
        }
        if let Some(key) = &self.access_key {
            builder = builder.access_key(key);
        }
        if let Some(key) = &self.secret_key {
            builder = builder.secret_key(key);
        }
        if let Some(bucket) = &self.bucket {
            builder = builder.bucket(bucket);
        }
        if let Some(region) = &self.region {
            builder = builder.region(region);
        }
        if let Some(dir) = &self.catalog_dir {
            builder = builder.catalog_dir(dir);
        }
        if let Some(dir) = &self.cache_dir {
            builder = builder.cache_dir(dir);
        }
        builder.build().context(ConfigSnafu)
    }

    async fn open(&self) -> CliResult<DivePond> {
        let mut context = PondContext::open(self.config()?).await.context(PondSnafu)?;
        if let Some(path) = &self.metadata {
            let metadata = StaticMetadata::from_json_file(path)
                .await
                .context(LoadMetadataSnafu {
                    path: path.display().to_string(),
                })?;
            context = context.with_metadata(Arc::new(metadata));
        }
        DivePond::with_context(context).await.context(PondSnafu)
    }
}

/// Filters shared by data, events and estimates.
#[derive(Debug, Args)]
struct FilterArgs {
    /// Repeatable animal id
    #[arg(long = "animal")]
    animals: Vec<String>,

    /// Repeatable deployment id
    #[arg(long = "deployment")]
    deployments: Vec<String>,

    /// Repeatable recording id
    #[arg(long = "recording")]
    recordings: Vec<String>,

    /// Start of an inclusive time window, RFC 3339
    #[arg(long, requires = "end")]
    start: Option<DateTime<Utc>>,

    /// End of an inclusive time window, RFC 3339
    #[arg(long, requires = "start")]
    end: Option<DateTime<Utc>>,
}

impl FilterArgs {
    fn date_range(&self) -> Option<DateRange> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(DateRange::new(start, end)),
            _ => None,
        }
    }
}

/// Channel filters of the data table.
#[derive(Debug, Args)]
struct ChannelFilterArgs {
    /// Repeatable channel label
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Repeatable channel group
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Repeatable channel class
    #[arg(long = "class")]
    classes: Vec<String>,
}

#[derive(Debug, Args)]
struct OutputArgs {
    #[arg(long, default_value_t = 10)]
    max_rows: usize,

    /// Also write the full result to this file
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormatArg::Csv)]
    format: OutputFormatArg,
}

impl From<OutputArgs> for OutputOpts {
    fn from(args: OutputArgs) -> Self {
        OutputOpts {
            max_rows: args.max_rows,
            output: args.output,
            format: args.format.into(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Remove cached results, optionally only those of one method
    Clear {
        /// e.g. get_data, get_events, get_available_channels
        #[arg(long)]
        method: Option<String>,
    },

    /// Remove expired cache entries
    Cleanup,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a dataset's tables and views (idempotent)
    Init { dataset: String },

    /// List initialized datasets
    Datasets,

    /// List deployments of every dataset, most recent first
    Deployments {
        #[arg(long, default_value_t = false)]
        json: bool,

        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },

    /// List the channels present in a dataset
    Channels {
        dataset: String,

        /// List grouped channels individually
        #[arg(long, default_value_t = false)]
        flat: bool,

        /// Attach metadata records (requires --metadata)
        #[arg(long, default_value_t = false)]
        with_metadata: bool,

        #[arg(long, default_value_t = false)]
        json: bool,

        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },

    /// Read signal data, optionally resampled and pivoted
    Data {
        dataset: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[command(flatten)]
        channels: ChannelFilterArgs,

        /// Target rate in Hz
        #[arg(long)]
        frequency: Option<f64>,

        #[arg(long)]
        limit: Option<usize>,

        /// One column per label instead of (datetime, label, value) rows
        #[arg(long, default_value_t = false)]
        pivot: bool,

        /// Shift datetimes by the deployment's timezone offset
        #[arg(long, default_value_t = false)]
        local_time: bool,

        /// Append an epoch-seconds `timestamp` column
        #[arg(long, default_value_t = false)]
        timestamp: bool,

        #[arg(long, default_value_t = false)]
        no_cache: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Read events
    Events {
        dataset: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Repeatable event key
        #[arg(long = "event-key")]
        event_keys: Vec<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = false)]
        local_time: bool,

        /// Append epoch-seconds `timestamp_start` and `timestamp_end` columns
        #[arg(long, default_value_t = false)]
        timestamp: bool,

        #[arg(long, default_value_t = false)]
        no_cache: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Estimate how many readings a data request would scan
    Estimate {
        dataset: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[command(flatten)]
        channels: ChannelFilterArgs,

        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },

    /// Write a long-format CSV (datetime, label, value[, group][, class])
    IngestCsv {
        dataset: String,

        #[arg(long)]
        csv: PathBuf,

        #[arg(long)]
        animal: String,

        #[arg(long)]
        deployment: String,

        #[arg(long)]
        recording: Option<String>,

        /// Class of rows without a `class` column value
        #[arg(long, default_value = "sensor")]
        class: String,
    },

    /// Remove a dataset with its tables and views
    Remove { dataset: String },

    /// Report datasets left inconsistent by interrupted operations
    Reconcile,

    /// Maintain the query cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Run read-only SQL against the registered views
    Sql {
        sql: String,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Debug, Parser)]
#[command(name = "divelake", version)]
struct Cli {
    #[command(flatten)]
    warehouse: WarehouseArgs,

    #[command(subcommand)]
    cmd: Command,
}

fn filter(values: Vec<String>) -> Option<FilterValues> {
    (!values.is_empty()).then(|| FilterValues::from(values))
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn data_request(
    filters: FilterArgs,
    channels: ChannelFilterArgs,
    use_cache: bool,
) -> DataRequest {
    DataRequest {
        date_range: filters.date_range(),
        labels: filter(channels.labels),
        groups: filter(channels.groups),
        classes: filter(channels.classes),
        animals: filter(filters.animals),
        deployments: filter(filters.deployments),
        recordings: filter(filters.recordings),
        use_cache,
        ..DataRequest::default()
    }
}

fn deployment_rows(summaries: &[DeploymentSummary]) -> Vec<Vec<String>> {
    summaries
        .iter()
        .map(|d| {
            vec![
                d.dataset.clone(),
                d.deployment.clone(),
                d.animal.clone(),
                format_time(&d.min_datetime),
                format_time(&d.max_datetime),
                d.sample_count.to_string(),
            ]
        })
        .collect()
}

fn channel_rows(catalog: &ChannelCatalog) -> Vec<Vec<String>> {
    let units = |m: Option<&divelake_pond::ChannelMetadata>| {
        m.and_then(|m| m.units.clone()).unwrap_or_default()
    };
    catalog
        .entries
        .iter()
        .map(|entry| match entry {
            ChannelEntry::Channel(c) => vec![
                c.label.clone(),
                c.group.clone().unwrap_or_default(),
                c.class.clone(),
                String::new(),
                units(c.metadata.as_ref()),
            ],
            ChannelEntry::Group(g) => {
                let labels: Vec<&str> = g.channels.iter().map(|c| c.label.as_str()).collect();
                let mut coverage = format!("{}/{} [{}]", g.present, g.available, labels.join(", "));
                if !g.missing.is_empty() {
                    coverage.push_str(&format!(" missing [{}]", g.missing.join(", ")));
                }
                let mut classes: Vec<&str> = g.channels.iter().map(|c| c.class.as_str()).collect();
                classes.dedup();
                vec![
                    g.group.clone(),
                    g.group.clone(),
                    classes.join(", "),
                    coverage,
                    units(g.metadata.as_ref()),
                ]
            }
        })
        .collect()
}

async fn cmd_ingest_csv<W: Write>(
    pond: &DivePond,
    dataset: &str,
    csv: &Path,
    metadata: SignalMetadata,
    class: &str,
    out: &mut W,
) -> CliResult<()> {
    let summary = ingest::ingest_csv(pond, dataset, csv, &metadata, class).await?;
    writeln!(
        out,
        "Ingested {} reading(s) in {} channel(s) into {dataset}",
        summary.rows, summary.channels
    )
    .context(WriteOutputSnafu)
}

async fn dispatch<W: Write>(pond: &DivePond, cmd: Command, out: &mut W) -> CliResult<()> {
    match cmd {
        Command::Init { dataset } => {
            pond.datasets()
                .ensure_dataset_initialized(&dataset)
                .await
                .context(PondSnafu)?;
            writeln!(
                out,
                "Initialized dataset {dataset} (views {}, {})",
                pond.get_view_name(&dataset, TableKind::Data),
                pond.get_view_name(&dataset, TableKind::Events)
            )
            .context(WriteOutputSnafu)
        }

        Command::Datasets => {
            let names = pond.datasets().get_all_datasets().await.context(PondSnafu)?;
            let rows: Vec<Vec<String>> = names.into_iter().map(|n| vec![n]).collect();
            emit_rows("datasets", &["dataset"], &rows, out)
        }

        Command::Deployments { json, no_cache } => {
            let summaries = pond
                .get_all_datasets_and_deployments(!no_cache)
                .await
                .context(PondSnafu)?;
            if json {
                return emit_json(&summaries, out);
            }
            emit_rows(
                "deployments",
                &["dataset", "deployment", "animal", "first", "last", "samples"],
                &deployment_rows(&summaries),
                out,
            )
        }

        Command::Channels {
            dataset,
            flat,
            with_metadata,
            json,
            no_cache,
        } => {
            let options = ChannelOptions {
                include_metadata: with_metadata,
                pack_groups: !flat,
                load_metadata: true,
            };
            let catalog = pond
                .get_available_channels(&dataset, options, !no_cache)
                .await
                .context(PondSnafu)?;
            if json {
                return emit_json(&catalog, out);
            }
            emit_rows(
                "channels",
                &["channel", "group", "class", "coverage", "units"],
                &channel_rows(&catalog),
                out,
            )
        }

        Command::Data {
            dataset,
            filters,
            channels,
            frequency,
            limit,
            pivot,
            local_time,
            timestamp,
            no_cache,
            output,
        } => {
            let request = DataRequest {
                frequency,
                limit,
                pivoted: pivot,
                apply_timezone_offset: local_time,
                add_timestamp_column: timestamp,
                ..data_request(filters, channels, !no_cache)
            };
            let batch = pond.get_data(&dataset, &request).await.context(PondSnafu)?;
            let title = pond.get_view_name(&dataset, TableKind::Data);
            emit_batch(&title, &batch, &output.into(), out)
        }

        Command::Events {
            dataset,
            filters,
            event_keys,
            limit,
            local_time,
            timestamp,
            no_cache,
            output,
        } => {
            let request = EventsRequest {
                date_range: filters.date_range(),
                animals: filter(filters.animals),
                deployments: filter(filters.deployments),
                recordings: filter(filters.recordings),
                event_keys: filter(event_keys),
                limit,
                apply_timezone_offset: local_time,
                add_timestamp_columns: timestamp,
                use_cache: !no_cache,
            };
            let batch = pond.get_events(&dataset, &request).await.context(PondSnafu)?;
            let title = pond.get_view_name(&dataset, TableKind::Events);
            emit_batch(&title, &batch, &output.into(), out)
        }

        Command::Estimate {
            dataset,
            filters,
            channels,
            no_cache,
        } => {
            let request = data_request(filters, channels, !no_cache);
            let rows = pond
                .estimate_data_size(&dataset, &request)
                .await
                .context(PondSnafu)?;
            writeln!(out, "estimated_rows: {rows}").context(WriteOutputSnafu)
        }

        Command::IngestCsv {
            dataset,
            csv,
            animal,
            deployment,
            recording,
            class,
        } => {
            let mut metadata = SignalMetadata::new(animal, deployment);
            if let Some(recording) = recording {
                metadata = metadata.with_recording(recording);
            }
            cmd_ingest_csv(pond, &dataset, &csv, metadata, &class, out).await
        }

        Command::Remove { dataset } => {
            pond.datasets()
                .remove_dataset(&dataset)
                .await
                .context(PondSnafu)?;
            writeln!(out, "Removed dataset {dataset}").context(WriteOutputSnafu)
        }

        Command::Reconcile => {
            let findings = pond.datasets().reconcile().await.context(PondSnafu)?;
            let rows: Vec<Vec<String>> = findings
                .iter()
                .map(|f| vec![f.dataset.clone(), f.issue.to_string()])
                .collect();
            emit_rows("inconsistencies", &["dataset", "issue"], &rows, out)
        }

        Command::Cache { action } => {
            let removed = match action {
                CacheCommand::Clear { method } => pond.clear_cache(method.as_deref()).await,
                CacheCommand::Cleanup => pond.cleanup_expired().await,
            }
            .context(PondSnafu)?;
            writeln!(out, "Removed {removed} cache entries").context(WriteOutputSnafu)
        }

        Command::Sql { sql, output } => {
            let batch = pond.run_sql(&sql).await.context(PondSnafu)?;
            emit_batch("sql", &batch, &output.into(), out)
        }
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    let pond = cli.warehouse.open().await?;

    let mut stdout = std::io::stdout().lock();
    let result = dispatch(&pond, cli.cmd, &mut stdout).await;
    pond.close().await;
    result
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn data_flags_map_onto_the_request() {
        let cli = Cli::try_parse_from([
            "divelake",
            "data",
            "seals",
            "--label",
            "depth",
            "--label",
            "temp",
            "--deployment",
            "d1",
            "--frequency",
            "2.5",
            "--pivot",
            "--no-cache",
        ])
        .unwrap();
        let Command::Data {
            filters,
            channels,
            frequency,
            pivot,
            no_cache,
            ..
        } = cli.cmd
        else {
            panic!("expected the data command");
        };

        let request = DataRequest {
            frequency,
            pivoted: pivot,
            ..data_request(filters, channels, !no_cache)
        };
        assert_eq!(request.labels, Some(FilterValues::from(vec!["depth", "temp"])));
        assert_eq!(request.deployments, Some(FilterValues::from("d1")));
        assert_eq!(request.animals, None);
        assert_eq!(request.frequency, Some(2.5));
        assert!(request.pivoted);
        assert!(!request.use_cache);
    }

    #[test]
    fn time_window_needs_both_ends() {
        let parsed = Cli::try_parse_from([
            "divelake",
            "events",
            "seals",
            "--start",
            "2024-01-01T00:00:00Z",
        ]);
        assert!(parsed.is_err());
    }
}
