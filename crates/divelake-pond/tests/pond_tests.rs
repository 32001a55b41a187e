//! End-to-end tests of the pond over a local warehouse.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Float64Type, Int64Type, Schema, TimestampMicrosecondType};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use divelake_core::config::WarehouseConfig;
use divelake_core::lake_table::{UTC, WriteMode, timestamp_type};
use divelake_core::transaction_log::TableKind;
use divelake_pond::channels::ChannelEntry;
use divelake_pond::series::long_schema;
use divelake_pond::{
    ChannelMetadata, ChannelOptions, DataRequest, DateRange, DivePond, ErrorKind, EventsRequest,
    CacheLayer, PondContext, PondError, SignalMetadata, SignalValue, StaticMetadata, TtlClass,
    TtlPolicy,
};
use tempfile::TempDir;

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

const DS: &str = "seals";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

async fn open_pond(tmp: &TempDir, metadata: StaticMetadata) -> TestResult<DivePond> {
    let config = WarehouseConfig::local(tmp.path())?;
    let context = PondContext::open(config).await?.with_metadata(Arc::new(metadata));
    Ok(DivePond::with_context(context).await?)
}

async fn ready_pond(tmp: &TempDir) -> TestResult<DivePond> {
    let pond = open_pond(tmp, StaticMetadata::new()).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;
    Ok(pond)
}

/// Write `n` readings of `label` at `hz`, starting at `start`, values `0, 1, 2, ...`.
async fn write_channel(
    pond: &DivePond,
    deployment: &str,
    group: Option<&str>,
    label: &str,
    hz: f64,
    n: usize,
    start: DateTime<Utc>,
) -> TestResult<u64> {
    let step = TimeDelta::microseconds((1_000_000.0 / hz).round() as i64);
    let times: Vec<_> = (0..n).map(|i| start + step * i as i32).collect();
    let values: Vec<_> = (0..n).map(|i| SignalValue::Double(i as f64)).collect();
    let metadata = SignalMetadata::new("seal-1", deployment);
    Ok(pond
        .write_signal_data(DS, &metadata, &times, group, "sensor", label, &values)
        .await?)
}

fn micros(batch: &RecordBatch, column: &str) -> Vec<i64> {
    batch
        .column_by_name(column)
        .unwrap()
        .as_primitive::<TimestampMicrosecondType>()
        .values()
        .to_vec()
}

fn floats(batch: &RecordBatch, column: &str) -> Vec<Option<f64>> {
    let array = batch.column_by_name(column).unwrap().as_primitive::<Float64Type>();
    (0..array.len())
        .map(|i| array.is_valid(i).then(|| array.value(i)))
        .collect()
}

#[tokio::test]
async fn initialization_twice_is_harmless() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;

    assert_eq!(pond.datasets().get_all_datasets().await?, vec![DS.to_string()]);
    assert_eq!(pond.get_view_name(DS, TableKind::Data), "seals_Data");
    assert_eq!(pond.get_view_name(DS, TableKind::Events), "seals_Events");
    Ok(())
}

#[tokio::test]
async fn written_rows_are_read_back_immediately() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;

    let written = write_channel(&pond, "d1", None, "depth", 1.0, 50, t0()).await?;
    assert_eq!(written, 50);

    let batch = pond
        .get_data(DS, &DataRequest::new().labels("depth").use_cache(false))
        .await?;
    assert_eq!(batch.num_rows(), 50);
    assert_eq!(batch.schema(), long_schema());
    assert_eq!(floats(&batch, "numeric_value")[49], Some(49.0));
    Ok(())
}

#[tokio::test]
async fn cached_results_may_be_stale_until_bypassed() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 10, t0()).await?;

    let request = DataRequest::new().labels("depth");
    assert_eq!(pond.get_data(DS, &request).await?.num_rows(), 10);

    write_channel(&pond, "d1", None, "depth", 1.0, 10, t0() + TimeDelta::seconds(60)).await?;
    assert_eq!(pond.get_data(DS, &request).await?.num_rows(), 10);
    let fresh = pond.get_data(DS, &request.clone().use_cache(false)).await?;
    assert_eq!(fresh.num_rows(), 20);
    Ok(())
}

#[tokio::test]
async fn filter_order_hits_the_same_cache_entry() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "a", 1.0, 5, t0()).await?;
    write_channel(&pond, "d1", None, "b", 1.0, 5, t0()).await?;

    pond.get_data(DS, &DataRequest::new().labels(["a", "b"])).await?;
    pond.get_data(DS, &DataRequest::new().labels(["b", "a"])).await?;
    pond.get_data(DS, &DataRequest::new().labels(["b", "a"]).add_timestamp_column(true))
        .await?;

    let entries = std::fs::read_dir(pond.cache().dir())?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".entry"))
        .count();
    assert_eq!(entries, 1);
    Ok(())
}

#[tokio::test]
async fn unknown_animal_gives_an_empty_typed_result() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 5, t0()).await?;

    let long = pond
        .get_data(DS, &DataRequest::new().animals("walrus-9"))
        .await?;
    assert_eq!(long.num_rows(), 0);
    assert_eq!(long.schema(), long_schema());

    let wide = pond
        .get_data(DS, &DataRequest::new().animals("walrus-9").pivoted(true))
        .await?;
    assert_eq!(wide.num_rows(), 0);
    assert_eq!(wide.schema().field(0).name(), "datetime");
    Ok(())
}

#[tokio::test]
async fn unknown_dataset_is_not_found() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let err = pond
        .get_data("ghost", &DataRequest::new())
        .await
        .expect_err("ghost does not exist");
    assert_eq!(err.kind(), ErrorKind::DatasetNotFound);
    Ok(())
}

#[tokio::test]
async fn requesting_the_native_rate_keeps_every_sample() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "accel", 10.0, 100, t0()).await?;

    let same = pond
        .get_data(DS, &DataRequest::new().frequency(10.0).use_cache(false))
        .await?;
    assert_eq!(same.num_rows(), 100);

    let half = pond
        .get_data(DS, &DataRequest::new().frequency(5.0).use_cache(false))
        .await?;
    assert_eq!(half.num_rows(), 50);
    let times = micros(&half, "datetime");
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[tokio::test]
async fn upsampling_repeats_the_last_real_value() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let metadata = SignalMetadata::new("seal-1", "d1");
    pond.write_signal_data(
        DS,
        &metadata,
        &[t0(), t0() + TimeDelta::seconds(10)],
        None,
        "sensor",
        "depth",
        &[SignalValue::Double(1.0), SignalValue::Double(2.0)],
    )
    .await?;

    let batch = pond
        .get_data(DS, &DataRequest::new().frequency(0.2).use_cache(false))
        .await?;
    let start = t0().timestamp_micros();
    assert_eq!(
        micros(&batch, "datetime"),
        vec![start, start + 5_000_000, start + 10_000_000]
    );
    assert_eq!(
        floats(&batch, "numeric_value"),
        vec![Some(1.0), Some(1.0), Some(2.0)]
    );
    Ok(())
}

#[tokio::test]
async fn limit_applies_to_the_resampled_series() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "accel", 10.0, 2000, t0()).await?;

    let batch = pond
        .get_data(
            DS,
            &DataRequest::new().frequency(1.0).limit(100).use_cache(false),
        )
        .await?;
    assert_eq!(batch.num_rows(), 100);
    let times = micros(&batch, "datetime");
    // 100 raw rows would cover 10 seconds; 100 resampled rows cover 99.
    assert_eq!(times[99] - times[0], 99_000_000);
    Ok(())
}

#[tokio::test]
async fn pivot_aligns_disjoint_timestamps() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let metadata = SignalMetadata::new("seal-1", "d1");
    let at = |s: i64| t0() + TimeDelta::seconds(s);
    pond.write_signal_data(
        DS,
        &metadata,
        &[at(0), at(2)],
        None,
        "sensor",
        "a",
        &[SignalValue::Double(1.0), SignalValue::Double(3.0)],
    )
    .await?;
    pond.write_signal_data(
        DS,
        &metadata,
        &[at(1), at(2)],
        None,
        "sensor",
        "b",
        &[SignalValue::Int(20), SignalValue::Int(30)],
    )
    .await?;

    let wide = pond
        .get_data(DS, &DataRequest::new().pivoted(true).use_cache(false))
        .await?;
    assert_eq!(wide.num_rows(), 3);
    let names: Vec<_> = wide.schema().fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(names, vec!["datetime", "a", "b"]);
    assert_eq!(floats(&wide, "a"), vec![Some(1.0), None, Some(3.0)]);
    assert_eq!(floats(&wide, "b"), vec![None, Some(20.0), Some(30.0)]);
    Ok(())
}

#[tokio::test]
async fn timestamp_column_holds_epoch_seconds() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 3, t0()).await?;

    let batch = pond
        .get_data(DS, &DataRequest::new().add_timestamp_column(true))
        .await?;
    let seconds = floats(&batch, "timestamp");
    assert_eq!(seconds[0], Some(t0().timestamp() as f64));
    assert_eq!(seconds[2], Some(t0().timestamp() as f64 + 2.0));
    Ok(())
}

#[tokio::test]
async fn timezone_offset_shifts_emitted_datetimes() -> TestResult {
    let tmp = TempDir::new()?;
    let metadata = StaticMetadata::new().with_timezone_offset("d1", 2.5);
    let pond = open_pond(&tmp, metadata).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 3, t0()).await?;

    let shifted = pond
        .get_data(
            DS,
            &DataRequest::new().deployments("d1").apply_timezone_offset(true),
        )
        .await?;
    let expected = (t0() + TimeDelta::minutes(150)).timestamp_micros();
    assert_eq!(micros(&shifted, "datetime")[0], expected);

    assert_eq!(pond.get_deployment_timezone_offset("d1", true).await?, 2.5);
    assert_eq!(pond.get_deployment_timezone_offset("d9", true).await?, 0.0);
    Ok(())
}

#[tokio::test]
async fn timezone_offset_does_not_depend_on_deployment_order() -> TestResult {
    let tmp = TempDir::new()?;
    let metadata = StaticMetadata::new()
        .with_timezone_offset("d1", 0.0)
        .with_timezone_offset("d2", 5.0);
    let pond = open_pond(&tmp, metadata).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 1, t0()).await?;
    write_channel(&pond, "d2", None, "depth", 1.0, 1, t0() + TimeDelta::seconds(1)).await?;

    let request = |order: [&str; 2], use_cache: bool| {
        DataRequest::new()
            .deployments(order)
            .pivoted(true)
            .apply_timezone_offset(true)
            .use_cache(use_cache)
    };
    let d2_first_cached = pond.get_data(DS, &request(["d2", "d1"], true)).await?;
    let d1_first_cached = pond.get_data(DS, &request(["d1", "d2"], true)).await?;
    let d2_first_fresh = pond.get_data(DS, &request(["d2", "d1"], false)).await?;
    let d1_first_fresh = pond.get_data(DS, &request(["d1", "d2"], false)).await?;

    // The smallest deployment id (d1, +0 h) decides the shift in every order.
    let start = t0().timestamp_micros();
    let expected = vec![start, start + 1_000_000];
    assert_eq!(micros(&d2_first_cached, "datetime"), expected);
    assert_eq!(micros(&d1_first_cached, "datetime"), expected);
    assert_eq!(micros(&d2_first_fresh, "datetime"), expected);
    assert_eq!(micros(&d1_first_fresh, "datetime"), expected);

    let events = pond
        .get_events(
            DS,
            &EventsRequest::new()
                .deployments(["d2", "d1"])
                .apply_timezone_offset(true),
        )
        .await?;
    assert_eq!(events.num_rows(), 0);
    Ok(())
}

#[tokio::test]
async fn equal_timestamps_keep_write_order_through_decimation() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let metadata = SignalMetadata::new("seal-1", "d1");
    let at = |s: i64| t0() + TimeDelta::seconds(s);
    let doubles = |v: &[f64]| v.iter().map(|x| SignalValue::Double(*x)).collect::<Vec<_>>();

    // One write holding each timestamp twice, then a later write that
    // repeats the first two timestamps.
    pond.write_signal_data(
        DS,
        &metadata,
        &[at(0), at(0), at(1), at(1), at(2), at(2), at(3), at(3)],
        None,
        "sensor",
        "depth",
        &doubles(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
    )
    .await?;
    pond.write_signal_data(
        DS,
        &metadata,
        &[at(1), at(0)],
        None,
        "sensor",
        "depth",
        &doubles(&[11.0, 10.0]),
    )
    .await?;

    let native = pond
        .get_data(DS, &DataRequest::new().frequency(1.0).use_cache(false))
        .await?;
    assert_eq!(
        floats(&native, "numeric_value"),
        [0.0, 1.0, 10.0, 2.0, 3.0, 11.0, 4.0, 5.0, 6.0, 7.0]
            .map(Some)
            .to_vec()
    );

    // Stride 2 keeps every other reading in that order.
    let halved = pond
        .get_data(DS, &DataRequest::new().frequency(0.5).use_cache(false))
        .await?;
    assert_eq!(
        floats(&halved, "numeric_value"),
        vec![Some(0.0), Some(10.0), Some(3.0), Some(4.0), Some(6.0)]
    );
    Ok(())
}

#[tokio::test]
async fn each_read_expires_with_its_ttl_class() -> TestResult {
    let tmp = TempDir::new()?;
    let policy = TtlPolicy::default()
        .with_ttl(TtlClass::Metadata, TimeDelta::zero())
        .with_ttl(TtlClass::Events, TimeDelta::zero());
    let config = WarehouseConfig::local(tmp.path())?;
    let context = PondContext::open(config)
        .await?
        .with_cache(CacheLayer::with_policy(tmp.path().join("cache"), policy));
    let pond = DivePond::with_context(context).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 10, t0()).await?;

    let options = ChannelOptions {
        load_metadata: false,
        ..ChannelOptions::default()
    };
    let request = DataRequest::new();
    assert_eq!(pond.get_data(DS, &request).await?.num_rows(), 10);
    assert_eq!(pond.estimate_data_size(DS, &request).await?, 10);
    let channels = pond.get_available_channels(DS, options, true).await?;
    assert_eq!(channels.channels().count(), 1);

    write_channel(&pond, "d1", None, "temp", 1.0, 5, t0()).await?;

    // Signal entries live for a day; estimates and catalogs expired at once.
    assert_eq!(pond.get_data(DS, &request).await?.num_rows(), 10);
    assert_eq!(pond.estimate_data_size(DS, &request).await?, 15);
    let channels = pond.get_available_channels(DS, options, true).await?;
    assert_eq!(channels.channels().count(), 2);
    Ok(())
}

#[tokio::test]
async fn mixed_value_types_are_a_schema_mismatch() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let metadata = SignalMetadata::new("seal-1", "d1");

    let err = pond
        .write_signal_data(
            DS,
            &metadata,
            &[t0(), t0() + TimeDelta::seconds(1)],
            None,
            "sensor",
            "state",
            &[SignalValue::Double(1.0), SignalValue::from("diving")],
        )
        .await
        .expect_err("mixed types");
    assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    assert!(matches!(err, PondError::SchemaMismatch { .. }));
    Ok(())
}

fn events_batch(rows: &[(&str, i64, Option<i64>)]) -> TestResult<RecordBatch> {
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
    let base = t0().timestamp_micros();
    Ok(RecordBatch::try_new(
        schema,
        vec![
            constant(DS),
            constant("seal-1"),
            constant("d1"),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0))),
            Arc::new(
                TimestampMicrosecondArray::from_iter_values(
                    rows.iter().map(|r| base + r.1 * 1_000_000),
                )
                .with_timezone(UTC),
            ),
            Arc::new(
                TimestampMicrosecondArray::from(
                    rows.iter()
                        .map(|r| r.2.map(|s| base + s * 1_000_000))
                        .collect::<Vec<_>>(),
                )
                .with_timezone(UTC),
            ),
            constant("{}"),
        ],
    )?)
}

#[tokio::test]
async fn events_are_ordered_and_stamped() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let batch = events_batch(&[
        ("dive", 60, Some(120)),
        ("tag_on", 0, None),
        ("dive", 300, Some(360)),
    ])?;
    let outcome = pond
        .write_to_lake(&batch, TableKind::Events, DS, WriteMode::Append, false)
        .await?;
    assert_eq!(outcome.rows_written, 3);

    let events = pond
        .get_events(DS, &EventsRequest::new().add_timestamp_columns(true))
        .await?;
    let keys = events.column_by_name("event_key").unwrap().as_string::<i32>();
    assert_eq!(keys.value(0), "tag_on");
    assert_eq!(keys.value(1), "dive");
    assert_eq!(floats(&events, "timestamp_end")[0], None);
    assert_eq!(
        floats(&events, "timestamp_start")[1],
        Some(t0().timestamp() as f64 + 60.0)
    );

    let window = DateRange::new(t0() + TimeDelta::seconds(60), t0() + TimeDelta::seconds(300));
    let dives = pond
        .get_events(
            DS,
            &EventsRequest::new().event_keys("dive").date_range(window).use_cache(false),
        )
        .await?;
    assert_eq!(dives.num_rows(), 2);
    Ok(())
}

#[tokio::test]
async fn skipped_refresh_hides_rows_until_views_refresh() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let batch = events_batch(&[("dive", 0, Some(30))])?;
    pond.write_to_lake(&batch, TableKind::Events, DS, WriteMode::Append, true)
        .await?;

    let request = EventsRequest::new().use_cache(false);
    assert_eq!(pond.get_events(DS, &request).await?.num_rows(), 0);
    pond.datasets().refresh_views(DS).await?;
    assert_eq!(pond.get_events(DS, &request).await?.num_rows(), 1);
    Ok(())
}

#[tokio::test]
async fn channel_catalog_packs_groups_with_coverage() -> TestResult {
    let tmp = TempDir::new()?;
    let metadata = StaticMetadata::new()
        .with_channel(ChannelMetadata {
            channel_id: "imu".to_string(),
            children: vec!["ax".into(), "ay".into(), "az".into()],
            ..ChannelMetadata::default()
        })
        .with_channel(ChannelMetadata {
            channel_id: "depth".to_string(),
            units: Some("m".to_string()),
            ..ChannelMetadata::default()
        });
    let pond = open_pond(&tmp, metadata).await?;
    pond.datasets().ensure_dataset_initialized(DS).await?;
    write_channel(&pond, "d1", Some("imu"), "ax", 1.0, 2, t0()).await?;
    write_channel(&pond, "d1", Some("imu"), "ay", 1.0, 2, t0()).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 2, t0()).await?;

    let options = ChannelOptions {
        include_metadata: true,
        ..ChannelOptions::default()
    };
    let catalog = pond.get_available_channels(DS, options, false).await?;
    assert_eq!(catalog.entries.len(), 2);
    let ChannelEntry::Channel(depth) = &catalog.entries[0] else {
        panic!("expected depth first");
    };
    assert_eq!(depth.metadata.as_ref().and_then(|m| m.units.as_deref()), Some("m"));
    let ChannelEntry::Group(imu) = &catalog.entries[1] else {
        panic!("expected the imu group");
    };
    assert_eq!((imu.present, imu.available), (2, 3));
    assert_eq!(imu.missing, vec!["az".to_string()]);

    let flat = pond
        .get_available_channels(
            DS,
            ChannelOptions {
                pack_groups: false,
                load_metadata: false,
                ..ChannelOptions::default()
            },
            true,
        )
        .await?;
    assert_eq!(flat.entries.len(), 3);
    assert_eq!(flat.channels().count(), 3);

    let records = pond
        .get_channels_metadata(DS, ["imu", "unknown", "depth"], true)
        .await?;
    let ids: Vec<_> = records.iter().map(|r| r.channel_id.as_str()).collect();
    assert_eq!(ids, vec!["depth", "imu"]);
    Ok(())
}

#[tokio::test]
async fn estimates_use_statistics_or_count() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 30, t0()).await?;
    write_channel(&pond, "d1", None, "temp", 1.0, 20, t0()).await?;

    let all = pond.estimate_data_size(DS, &DataRequest::new()).await?;
    assert_eq!(all, 50);
    let depth = pond
        .estimate_data_size(DS, &DataRequest::new().labels("depth"))
        .await?;
    assert_eq!(depth, 30);

    let window = DateRange::new(t0(), t0() + TimeDelta::seconds(9));
    let windowed = pond
        .estimate_data_size(DS, &DataRequest::new().date_range(window))
        .await?;
    assert_eq!(windowed, 20);
    Ok(())
}

#[tokio::test]
async fn deployments_are_listed_most_recent_first() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d-early", None, "depth", 1.0, 5, t0()).await?;
    write_channel(&pond, "d-late", None, "depth", 1.0, 7, t0() + TimeDelta::days(30)).await?;

    let listing = pond.get_all_datasets_and_deployments(false).await?;
    let names: Vec<_> = listing.iter().map(|d| d.deployment.as_str()).collect();
    assert_eq!(names, vec!["d-late", "d-early"]);
    assert_eq!(listing[0].sample_count, 7);
    assert_eq!(listing[1].min_datetime, t0());
    assert_eq!(listing[1].max_datetime, t0() + TimeDelta::seconds(4));
    Ok(())
}

#[tokio::test]
async fn sql_reads_registered_views() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 4, t0()).await?;

    let batch = pond
        .run_sql(r#"SELECT COUNT(*) AS n FROM "seals_Data""#)
        .await?;
    let n = batch.column_by_name("n").unwrap().as_primitive::<Int64Type>();
    assert_eq!(n.value(0), 4);

    let err = pond.run_sql("SELECT * FROM missing_view").await.expect_err("bad sql");
    assert_eq!(err.kind(), ErrorKind::Query);
    Ok(())
}

#[tokio::test]
async fn invalid_frequency_is_a_query_error() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    let err = pond
        .get_data(DS, &DataRequest::new().frequency(0.0))
        .await
        .expect_err("zero Hz");
    assert_eq!(err.kind(), ErrorKind::Query);
    Ok(())
}

#[tokio::test]
async fn removed_datasets_are_gone_after_restart() -> TestResult {
    let tmp = TempDir::new()?;
    {
        let pond = ready_pond(&tmp).await?;
        pond.datasets().ensure_dataset_initialized("whales").await?;
        write_channel(&pond, "d1", None, "depth", 1.0, 3, t0()).await?;
        pond.datasets().remove_dataset("whales").await?;
    }

    let pond = open_pond(&tmp, StaticMetadata::new()).await?;
    assert_eq!(pond.datasets().get_all_datasets().await?, vec![DS.to_string()]);
    let rows = pond
        .get_data(DS, &DataRequest::new().use_cache(false))
        .await?
        .num_rows();
    assert_eq!(rows, 3);
    let err = pond
        .get_data("whales", &DataRequest::new())
        .await
        .expect_err("removed");
    assert_eq!(err.kind(), ErrorKind::DatasetNotFound);
    Ok(())
}

#[tokio::test]
async fn closed_engine_rejects_queries() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    assert!(pond.close().await);
    assert!(!pond.close().await);

    let err = pond
        .run_sql("SELECT 1")
        .await
        .expect_err("closed session");
    assert_eq!(err.kind(), ErrorKind::EngineInit);
    Ok(())
}

#[tokio::test]
async fn cache_maintenance_counts_entries() -> TestResult {
    let tmp = TempDir::new()?;
    let pond = ready_pond(&tmp).await?;
    write_channel(&pond, "d1", None, "depth", 1.0, 3, t0()).await?;

    pond.get_data(DS, &DataRequest::new()).await?;
    pond.get_events(DS, &EventsRequest::new()).await?;
    assert_eq!(pond.cleanup_expired().await?, 0);
    assert_eq!(pond.clear_cache(Some("get_events")).await?, 1);
    assert_eq!(pond.clear_cache(None).await?, 1);
    Ok(())
}
