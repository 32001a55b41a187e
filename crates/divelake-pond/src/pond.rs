//! The query engine over one warehouse.
//!
//! [`DivePond`] answers the read surface (signal data, events, channel
//! catalogs, deployment listings, size estimates) through the dataset views
//! registered by [`DatasetManager`], and accepts writes that it publishes to
//! those views before returning. Read results go through the [`CacheLayer`]
//! unless the caller bypasses it.
//!
//! Signal reads follow one pipeline:
//!
//! 1. filter the data view with the request's [`Predicate`];
//! 2. project every reading to `numeric_value` and split per label, each
//!    label stably sorted by time so equal timestamps keep write order;
//! 3. resample each label on its own ([`crate::resample`]);
//! 4. pivot or keep the long form;
//! 5. shift by the deployment's timezone offset;
//! 6. cut to `limit` rows.
//!
//! Steps 1 to 6 are cached as a unit. The `timestamp` column is appended
//! afterwards, so it never changes which entry a request hits.

mod request;
mod signal;

use std::{collections::BTreeMap, slice, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, AsArray, RecordBatch},
    compute::{cast as cast_array, concat_batches},
    datatypes::{DataType, Int64Type, SchemaRef, TimestampMicrosecondType},
    error::ArrowError,
};
use chrono::{DateTime, Utc};
use datafusion::{
    common::TableReference,
    dataframe::DataFrame,
    error::DataFusionError,
    functions::expr_fn::coalesce,
    functions_aggregate::expr_fn::{count, max, min},
    logical_expr::{Expr, cast, ident, lit, try_cast},
};
use divelake_core::{
    config::WarehouseConfig,
    lake_table::{TableError, WriteMode, WriteOutcome},
    transaction_log::TableKind,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub use request::{DataRequest, EventsRequest};
pub use signal::{SignalError, SignalMetadata, SignalValue, infer_signal_type};

use crate::{
    cache::{CacheKey, CacheLayer, TtlClass},
    channels::{self, Channel, ChannelCatalog, ChannelOptions},
    context::PondContext,
    dataset::{DatasetManager, view_name},
    error::{
        CacheSnafu, EngineInitSnafu, InvalidRequestSnafu, PondError, PondResult, QuerySnafu,
        ReshapeSnafu, SchemaMismatchSnafu,
    },
    metadata::ChannelMetadata,
    pivot::pivot,
    predicate::{FilterValues, Predicate},
    resample::{requested_interval_micros, resample},
    series::{self, DATETIME, LABEL, NUMERIC_VALUE},
};
use signal::SignalRows;

const MICROS_PER_HOUR: f64 = 3_600_000_000.0;

/// One deployment of one dataset, as listed by
/// [`DivePond::get_all_datasets_and_deployments`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    /// Dataset holding the deployment.
    pub dataset: String,
    /// Deployment id.
    pub deployment: String,
    /// Animal the deployment was recorded on.
    pub animal: String,
    /// First reading.
    pub min_datetime: DateTime<Utc>,
    /// Last reading.
    pub max_datetime: DateTime<Utc>,
    /// Number of readings.
    pub sample_count: u64,
}

/// Query and write engine over one warehouse.
#[derive(Debug)]
pub struct DivePond {
    context: PondContext,
    datasets: DatasetManager,
}

impl DivePond {
    /// Open the warehouse described by `config` and register the views of
    /// every dataset already in it.
    pub async fn open(config: WarehouseConfig) -> PondResult<Self> {
        Self::with_context(PondContext::open(config).await?).await
    }

    /// Engine over an already opened context.
    pub async fn with_context(context: PondContext) -> PondResult<Self> {
        let datasets = DatasetManager::new(
            Arc::clone(context.catalog()),
            Arc::clone(context.connection()),
        );
        let loaded = datasets.load_existing().await?;
        log::info!("pond ready with {} dataset(s)", loaded.len());
        Ok(Self { context, datasets })
    }

    /// Shared handles this engine runs on.
    pub fn context(&self) -> &PondContext {
        &self.context
    }

    /// Dataset lifecycle manager.
    pub fn datasets(&self) -> &DatasetManager {
        &self.datasets
    }

    /// Query cache.
    pub fn cache(&self) -> &CacheLayer {
        self.context.cache()
    }

    /// Name of the view over `table` of `dataset`, for callers writing their
    /// own SQL. Quote it: view names are case-sensitive.
    pub fn get_view_name(&self, dataset: &str, table: TableKind) -> String {
        view_name(dataset, table)
    }

    /// Signal readings of `dataset` matching `request`.
    ///
    /// The long form has columns `datetime`, `label`, `numeric_value`,
    /// ordered by label then time. The pivoted form has `datetime` plus one
    /// column per label. Filters matching nothing give an empty result of
    /// the same shape.
    pub async fn get_data(&self, dataset: &str, request: &DataRequest) -> PondResult<RecordBatch> {
        self.datasets.require_ready(dataset).await?;
        if let Some(frequency) = request.frequency {
            requested_interval_micros(frequency).map_err(|e| {
                InvalidRequestSnafu {
                    predicate: request.predicate().describe(),
                    reason: e.to_string(),
                }
                .build()
            })?;
        }

        let key = request.cache_key(dataset);
        let batch = self
            .cache()
            .get_or_compute(&key, TtlClass::Signal, request.use_cache, || {
                self.compute_data(dataset, request)
            })
            .await?;

        if request.add_timestamp_column {
            return series::with_epoch_seconds(&batch, DATETIME, "timestamp").context(
                ReshapeSnafu {
                    predicate: request.predicate().describe(),
                },
            );
        }
        Ok(batch)
    }

    async fn compute_data(&self, dataset: &str, request: &DataRequest) -> PondResult<RecordBatch> {
        let predicate = request.predicate();
        let described = predicate.describe();
        let view = view_name(dataset, TableKind::Data);

        let readings = self
            .query(&view, &predicate, |df| {
                df.select(vec![
                    ident(DATETIME),
                    ident(LABEL),
                    numeric_value().alias(NUMERIC_VALUE),
                ])
            })
            .await?;

        let mut per_label = series::split_long(slice::from_ref(&readings))
            .context(ReshapeSnafu { predicate: described.as_str() })?;
        if let Some(frequency) = request.frequency {
            per_label = per_label
                .iter()
                .map(|s| resample(s, frequency))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    InvalidRequestSnafu {
                        predicate: described.as_str(),
                        reason: e.to_string(),
                    }
                    .build()
                })?;
        }

        let shaped = if request.pivoted {
            pivot(&per_label)
        } else {
            series::long_batch(&per_label)
        }
        .context(ReshapeSnafu { predicate: described.as_str() })?;

        let shifted = if request.apply_timezone_offset {
            let offset = self
                .offset_micros(request.timezone_deployment().as_deref(), request.use_cache)
                .await;
            series::shift_timestamps(&shaped, &[DATETIME], offset)
                .context(ReshapeSnafu { predicate: described.as_str() })?
        } else {
            shaped
        };

        let result = series::truncate(shifted, request.limit);
        log::debug!(
            "get_data on {dataset} [{described}] produced {} row(s)",
            result.num_rows()
        );
        Ok(result)
    }

    /// Events of `dataset` matching `request`, ordered by `datetime_start`.
    ///
    /// Point events have a null `datetime_end`.
    pub async fn get_events(
        &self,
        dataset: &str,
        request: &EventsRequest,
    ) -> PondResult<RecordBatch> {
        self.datasets.require_ready(dataset).await?;

        let key = request.cache_key(dataset);
        let batch = self
            .cache()
            .get_or_compute(&key, TtlClass::Events, request.use_cache, || {
                self.compute_events(dataset, request)
            })
            .await?;

        if !request.add_timestamp_columns {
            return Ok(batch);
        }
        let predicate = request.predicate().describe();
        let batch = series::with_epoch_seconds(&batch, "datetime_start", "timestamp_start")
            .context(ReshapeSnafu { predicate: predicate.as_str() })?;
        series::with_epoch_seconds(&batch, "datetime_end", "timestamp_end")
            .context(ReshapeSnafu { predicate })
    }

    async fn compute_events(
        &self,
        dataset: &str,
        request: &EventsRequest,
    ) -> PondResult<RecordBatch> {
        let predicate = request.predicate();
        let view = view_name(dataset, TableKind::Events);
        let limit = request.limit;

        let events = self
            .query(&view, &predicate, |df| {
                let df = df.sort(vec![ident("datetime_start").sort(true, false)])?;
                match limit {
                    Some(n) => df.limit(0, Some(n)),
                    None => Ok(df),
                }
            })
            .await?;

        if !request.apply_timezone_offset {
            return Ok(events);
        }
        let offset = self
            .offset_micros(request.timezone_deployment().as_deref(), request.use_cache)
            .await;
        series::shift_timestamps(&events, &["datetime_start", "datetime_end"], offset)
            .context(ReshapeSnafu { predicate: predicate.describe() })
    }

    /// Channels observed in `dataset`.
    pub async fn get_available_channels(
        &self,
        dataset: &str,
        options: ChannelOptions,
        use_cache: bool,
    ) -> PondResult<ChannelCatalog> {
        self.datasets.require_ready(dataset).await?;

        let key = CacheKey::new("get_available_channels")
            .arg("dataset", dataset)
            .arg("options", options);
        self.cache()
            .get_or_compute(&key, TtlClass::Metadata, use_cache, || {
                self.compute_channels(dataset, options)
            })
            .await
    }

    async fn compute_channels(
        &self,
        dataset: &str,
        options: ChannelOptions,
    ) -> PondResult<ChannelCatalog> {
        let view = view_name(dataset, TableKind::Data);
        let predicate = Predicate::new();
        let triples = self
            .query(&view, &predicate, |df| {
                df.select(vec![ident("group"), ident("class"), ident(LABEL)])?
                    .distinct()?
                    .sort(vec![
                        ident("group").sort(true, true),
                        ident(LABEL).sort(true, false),
                    ])
            })
            .await?;

        let mut found = channel_rows(&triples).context(ReshapeSnafu {
            predicate: predicate.describe(),
        })?;
        if options.load_metadata && options.include_metadata {
            for channel in &mut found {
                channel.metadata = self.lookup_channel(dataset, &channel.label).await;
            }
        }

        let mut group_metadata = BTreeMap::new();
        if options.load_metadata {
            let mut names: Vec<&str> = found.iter().filter_map(|c| c.group.as_deref()).collect();
            names.dedup();
            for name in names {
                if let Some(record) = self.lookup_channel(dataset, name).await {
                    group_metadata.insert(name.to_string(), record);
                }
            }
        }

        Ok(ChannelCatalog {
            dataset: dataset.to_string(),
            entries: channels::arrange(
                found,
                options.pack_groups,
                &group_metadata,
                options.include_metadata,
            ),
        })
    }

    /// Descriptive records for `channel_ids` (labels or group names), in id
    /// order. Ids the metadata collaborator does not know are skipped.
    pub async fn get_channels_metadata(
        &self,
        dataset: &str,
        channel_ids: impl Into<FilterValues>,
        use_cache: bool,
    ) -> PondResult<Vec<ChannelMetadata>> {
        let ids = channel_ids.into();
        let key = CacheKey::new("get_channels_metadata")
            .arg("dataset", dataset)
            .values("channel_ids", Some(&ids));
        self.cache()
            .get_or_compute(&key, TtlClass::Metadata, use_cache, || async {
                let mut records = Vec::new();
                for id in ids.canonical() {
                    if let Some(record) = self.lookup_channel(dataset, &id).await {
                        records.push(record);
                    }
                }
                Ok::<_, PondError>(records)
            })
            .await
    }

    /// Offset of `deployment`'s local time from UTC in hours, `0.0` when the
    /// metadata collaborator does not know it.
    pub async fn get_deployment_timezone_offset(
        &self,
        deployment: &str,
        use_cache: bool,
    ) -> PondResult<f64> {
        let key = CacheKey::new("get_deployment_timezone_offset").arg("deployment", deployment);
        self.cache()
            .get_or_compute(&key, TtlClass::Metadata, use_cache, || async {
                let hours = match self
                    .context
                    .metadata()
                    .deployment_timezone_offset(deployment)
                    .await
                {
                    Ok(hours) => hours.unwrap_or(0.0),
                    Err(e) => {
                        log::warn!("timezone lookup for deployment {deployment} failed: {e}");
                        0.0
                    }
                };
                Ok::<_, PondError>(hours)
            })
            .await
    }

    /// Every deployment of every valid dataset, most recent first.
    pub async fn get_all_datasets_and_deployments(
        &self,
        use_cache: bool,
    ) -> PondResult<Vec<DeploymentSummary>> {
        let key = CacheKey::new("get_all_datasets_and_deployments");
        self.cache()
            .get_or_compute(&key, TtlClass::Enumeration, use_cache, || {
                self.compute_deployments()
            })
            .await
    }

    async fn compute_deployments(&self) -> PondResult<Vec<DeploymentSummary>> {
        let mut summaries = Vec::new();
        for dataset in self.datasets.get_all_datasets().await? {
            let view = view_name(&dataset, TableKind::Data);
            let predicate = Predicate::new();
            let batch = self
                .query(&view, &predicate, |df| {
                    df.aggregate(
                        vec![ident("deployment"), ident("animal")],
                        vec![
                            min(ident(DATETIME)).alias("min_datetime"),
                            max(ident(DATETIME)).alias("max_datetime"),
                            count(lit(1)).alias("sample_count"),
                        ],
                    )
                })
                .await?;
            summaries.extend(deployment_rows(&dataset, &batch).context(ReshapeSnafu {
                predicate: format!("deployments of {dataset}"),
            })?);
        }

        summaries.sort_by(|a, b| {
            b.min_datetime
                .cmp(&a.min_datetime)
                .then_with(|| a.dataset.cmp(&b.dataset))
                .then_with(|| a.deployment.cmp(&b.deployment))
        });
        Ok(summaries)
    }

    /// Approximate number of readings `get_data` would scan for `request`.
    ///
    /// Requests filtering only on partition columns are answered from the
    /// row counts recorded per data file. Anything else runs a `COUNT(*)`.
    /// Frequency, limit and shaping options are ignored.
    pub async fn estimate_data_size(
        &self,
        dataset: &str,
        request: &DataRequest,
    ) -> PondResult<u64> {
        self.datasets.require_ready(dataset).await?;

        let key = request.estimate_key(dataset);
        self.cache()
            .get_or_compute(&key, TtlClass::Events, request.use_cache, || {
                self.compute_estimate(dataset, request)
            })
            .await
    }

    async fn compute_estimate(&self, dataset: &str, request: &DataRequest) -> PondResult<u64> {
        let predicate = request.predicate();
        if predicate.only_filters(TableKind::Data.partition_columns()) {
            let table = self.datasets.open_table(dataset, TableKind::Data).await?;
            let rows = table
                .state()
                .data_files()
                .filter(|file| predicate.matches_partitions(file))
                .map(|file| file.row_count)
                .sum::<u64>();
            log::debug!("estimated {rows} row(s) of {dataset} from file statistics");
            return Ok(rows);
        }

        let view = view_name(dataset, TableKind::Data);
        let counted = self
            .query(&view, &predicate, |df| {
                df.aggregate(vec![], vec![count(lit(1)).alias("n")])
            })
            .await?;
        let rows = counted
            .column_by_name("n")
            .and_then(|c| c.as_primitive_opt::<Int64Type>())
            .filter(|c| !c.is_empty() && c.is_valid(0))
            .map_or(0, |c| c.value(0).max(0) as u64);
        Ok(rows)
    }

    /// Append one channel's readings to `dataset` and publish them.
    ///
    /// `data_type` is taken from the values: integers mixed with doubles are
    /// stored as doubles, any other mix is a schema mismatch. Returns the
    /// number of rows written.
    #[allow(clippy::too_many_arguments)]
    pub async fn write_signal_data(
        &self,
        dataset: &str,
        metadata: &SignalMetadata,
        times: &[DateTime<Utc>],
        group: Option<&str>,
        class: &str,
        label: &str,
        values: &[SignalValue],
    ) -> PondResult<u64> {
        let rows = SignalRows {
            dataset,
            metadata,
            group,
            class,
            label,
        };
        let batch = rows.to_batch(times, values).map_err(|e| {
            SchemaMismatchSnafu {
                dataset,
                detail: format!("channel {label}: {e}"),
            }
            .build()
        })?;

        let outcome = self
            .write_to_lake(&batch, TableKind::Data, dataset, WriteMode::Append, false)
            .await?;
        Ok(outcome.rows_written)
    }

    /// Write a prebuilt batch into one table of `dataset`.
    ///
    /// Unless `skip_view_refresh` is set, the table's view is re-registered
    /// before returning so the rows are visible to the next read. Callers
    /// that skip it for a series of writes must call
    /// [`DatasetManager::refresh_views`] at the end.
    pub async fn write_to_lake(
        &self,
        batch: &RecordBatch,
        table: TableKind,
        dataset: &str,
        mode: WriteMode,
        skip_view_refresh: bool,
    ) -> PondResult<WriteOutcome> {
        self.datasets.require_ready(dataset).await?;
        let _guard = self.datasets.lock_dataset(dataset).await;

        let mut lake_table = self.datasets.open_table(dataset, table).await?;
        let outcome = match lake_table.write(batch, mode).await {
            Ok(outcome) => outcome,
            Err(TableError::SchemaMismatch { detail, .. }) => {
                return SchemaMismatchSnafu { dataset, detail }.fail();
            }
            Err(source) => {
                return Err(PondError::Table {
                    dataset: dataset.to_string(),
                    kind: table,
                    source,
                });
            }
        };

        if !skip_view_refresh {
            self.datasets.publish(dataset, lake_table.snapshot()).await?;
        }
        log::info!(
            "{mode} of {} row(s) into {dataset}.{table} at version {}",
            outcome.rows_written,
            outcome.version
        );
        Ok(outcome)
    }

    /// Run read-only SQL against the registered views. Not cached.
    pub async fn run_sql(&self, sql: &str) -> PondResult<RecordBatch> {
        let ctx = self.context.connection().acquire().await.context(EngineInitSnafu)?;
        let context = || QuerySnafu {
            view: "sql",
            predicate: sql,
        };
        let df = ctx.sql(sql).await.context(context())?;
        collect_one(df).await.context(context())
    }

    /// Remove cached results, all of them or those of one method. Returns
    /// the number of entries removed.
    pub async fn clear_cache(&self, method: Option<&str>) -> PondResult<usize> {
        self.cache().clear(method).await.context(CacheSnafu)
    }

    /// Remove expired cache entries. Returns the number removed.
    pub async fn cleanup_expired(&self) -> PondResult<usize> {
        self.cache().cleanup_expired().await.context(CacheSnafu)
    }

    /// Release the analytics session once running queries finish.
    ///
    /// Later calls that need the session fail with an engine error.
    pub async fn close(&self) -> bool {
        self.context.connection().close().await
    }

    /// Run `shape` over `view` filtered by `predicate` and collect the
    /// result into one batch.
    async fn query<F>(&self, view: &str, predicate: &Predicate, shape: F) -> PondResult<RecordBatch>
    where
        F: FnOnce(DataFrame) -> Result<DataFrame, DataFusionError>,
    {
        let ctx = self.context.connection().acquire().await.context(EngineInitSnafu)?;
        let context = || QuerySnafu {
            view,
            predicate: predicate.describe(),
        };
        let mut df = ctx.table(TableReference::bare(view)).await.context(context())?;
        if let Some(filter) = predicate.to_expr() {
            df = df.filter(filter).context(context())?;
        }
        let df = shape(df).context(context())?;
        collect_one(df).await.context(context())
    }

    async fn lookup_channel(&self, dataset: &str, channel_id: &str) -> Option<ChannelMetadata> {
        match self.context.metadata().channel_metadata(dataset, channel_id).await {
            Ok(record) => record,
            Err(e) => {
                log::warn!("metadata lookup for {dataset}/{channel_id} failed: {e}");
                None
            }
        }
    }

    async fn offset_micros(&self, deployment: Option<&str>, use_cache: bool) -> i64 {
        let Some(deployment) = deployment else {
            return 0;
        };
        match self.get_deployment_timezone_offset(deployment, use_cache).await {
            Ok(hours) => (hours * MICROS_PER_HOUR).round() as i64,
            Err(e) => {
                log::warn!("ignoring timezone of deployment {deployment}: {e}");
                0
            }
        }
    }
}

/// Readings as `Float64`, whichever value column holds them.
fn numeric_value() -> Expr {
    coalesce(vec![
        ident("val_dbl"),
        cast(ident("val_int"), DataType::Float64),
        try_cast(ident("val_bool"), DataType::Float64),
        try_cast(ident("val_str"), DataType::Float64),
    ])
}

/// Collect `df` into one batch, partition by partition.
///
/// Unsorted scans keep the commit order of the files they read, which is
/// the order readings sharing a timestamp are resampled in.
async fn collect_one(df: DataFrame) -> Result<RecordBatch, DataFusionError> {
    let schema: SchemaRef = Arc::clone(df.schema().inner());
    let partitions = df.collect_partitioned().await?;
    Ok(concat_batches(&schema, partitions.iter().flatten())?)
}

fn utf8_column(batch: &RecordBatch, name: &str) -> Result<ArrayRef, ArrowError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("missing column {name}")))?;
    cast_array(column, &DataType::Utf8)
}

fn channel_rows(batch: &RecordBatch) -> Result<Vec<Channel>, ArrowError> {
    let groups = utf8_column(batch, "group")?;
    let classes = utf8_column(batch, "class")?;
    let labels = utf8_column(batch, LABEL)?;
    let (groups, classes, labels) = (
        groups.as_string::<i32>(),
        classes.as_string::<i32>(),
        labels.as_string::<i32>(),
    );

    Ok((0..batch.num_rows())
        .filter(|&row| labels.is_valid(row))
        .map(|row| Channel {
            group: groups.is_valid(row).then(|| groups.value(row).to_string()),
            class: if classes.is_valid(row) {
                classes.value(row).to_string()
            } else {
                String::new()
            },
            label: labels.value(row).to_string(),
            metadata: None,
        })
        .collect())
}

fn deployment_rows(
    dataset: &str,
    batch: &RecordBatch,
) -> Result<Vec<DeploymentSummary>, ArrowError> {
    let deployments = utf8_column(batch, "deployment")?;
    let animals = utf8_column(batch, "animal")?;
    let (deployments, animals) = (deployments.as_string::<i32>(), animals.as_string::<i32>());

    let times = |name: &str| {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_primitive_opt::<TimestampMicrosecondType>())
            .ok_or_else(|| ArrowError::SchemaError(format!("expected timestamps in {name}")))
    };
    let mins = times("min_datetime")?;
    let maxs = times("max_datetime")?;
    let counts = batch
        .column_by_name("sample_count")
        .and_then(|c| c.as_primitive_opt::<Int64Type>())
        .ok_or_else(|| ArrowError::SchemaError("expected counts in sample_count".into()))?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if mins.is_null(row) || maxs.is_null(row) {
            continue;
        }
        let (Some(min_datetime), Some(max_datetime)) = (
            DateTime::from_timestamp_micros(mins.value(row)),
            DateTime::from_timestamp_micros(maxs.value(row)),
        ) else {
            continue;
        };
        rows.push(DeploymentSummary {
            dataset: dataset.to_string(),
            deployment: deployments.value(row).to_string(),
            animal: animals.value(row).to_string(),
            min_datetime,
            max_datetime,
            sample_count: counts.value(row).max(0) as u64,
        });
    }
    Ok(rows)
}
