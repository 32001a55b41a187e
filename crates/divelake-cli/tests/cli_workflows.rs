//! End-to-end tests of the `divelake` binary against a local warehouse.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const OBJECT_STORAGE_VARS: &[&str] = &[
    "S3_ENDPOINT",
    "S3_ACCESS_KEY",
    "S3_SECRET_KEY",
    "S3_BUCKET",
    "S3_REGION",
    "DIVELAKE_CATALOG_DIR",
    "DIVELAKE_CACHE_DIR",
    "DIVELAKE_METADATA",
];

fn cli(warehouse: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("divelake"));
    for var in OBJECT_STORAGE_VARS {
        cmd.env_remove(var);
    }
    cmd.env("DIVELAKE_WAREHOUSE", warehouse);
    cmd
}

fn write_readings(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join("readings.csv");
    std::fs::write(
        &path,
        "datetime,group,label,value\n\
         2024-01-01T00:00:00Z,,depth,10.5\n\
         2024-01-01T00:00:01Z,,depth,11\n\
         2024-01-01T00:00:02Z,,depth,12.25\n\
         2024-01-01T00:00:00Z,imu,ax,0.1\n\
         2024-01-01T00:00:01Z,imu,ax,0.2\n",
    )?;
    Ok(path)
}

fn init_and_ingest(warehouse: &Path, scratch: &Path) -> TestResult {
    cli(warehouse)
        .args(["init", "seals"])
        .assert()
        .success()
        .stdout(contains("seals_Data"));

    let csv = write_readings(scratch)?;
    cli(warehouse)
        .args(["ingest-csv", "seals", "--animal", "seal-1", "--deployment", "d1", "--csv"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(contains("Ingested 5 reading(s) in 2 channel(s)"));
    Ok(())
}

#[test]
fn init_is_listed_and_idempotent() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");

    cli(&warehouse).args(["datasets"]).assert().success().stdout(contains("(no datasets)"));
    cli(&warehouse).args(["init", "seals"]).assert().success();
    cli(&warehouse).args(["init", "seals"]).assert().success();
    cli(&warehouse)
        .args(["datasets"])
        .assert()
        .success()
        .stdout(contains("seals"));
    Ok(())
}

#[test]
fn ingested_readings_can_be_read_and_exported() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    cli(&warehouse)
        .args(["data", "seals", "--label", "depth", "--no-cache"])
        .assert()
        .success()
        .stdout(contains("12.25"))
        .stdout(contains("total_rows: 3"));

    let out = tmp.path().join("wide.csv");
    cli(&warehouse)
        .args(["data", "seals", "--pivot", "--max-rows", "0", "--output"])
        .arg(&out)
        .assert()
        .success()
        .stdout(contains("preview suppressed"))
        .stdout(contains("total_rows: 3"));
    let exported = std::fs::read_to_string(&out)?;
    assert_eq!(exported.lines().next(), Some("datetime,ax,depth"));
    assert_eq!(exported.lines().count(), 4);
    Ok(())
}

#[test]
fn estimates_and_sql_count_the_same_rows() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    cli(&warehouse)
        .args(["estimate", "seals", "--label", "ax"])
        .assert()
        .success()
        .stdout(contains("estimated_rows: 2"));

    let out = tmp.path().join("count.jsonl");
    cli(&warehouse)
        .args(["sql", r#"SELECT COUNT(*) AS n FROM "seals_Data""#, "--format", "jsonl"])
        .arg("--output")
        .arg(&out)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&out)?.trim(), r#"{"n":5}"#);
    Ok(())
}

#[test]
fn channels_and_deployments_are_listed() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    let metadata = tmp.path().join("metadata.json");
    std::fs::write(
        &metadata,
        r#"{"channels": [{"channel_id": "imu", "children": ["ax", "ay", "az"]}]}"#,
    )?;
    cli(&warehouse)
        .args(["channels", "seals", "--metadata"])
        .arg(&metadata)
        .assert()
        .success()
        .stdout(contains("depth"))
        .stdout(contains("1/3 [ax] missing [ay, az]"));

    cli(&warehouse)
        .args(["deployments", "--json"])
        .assert()
        .success()
        .stdout(contains(r#""deployment": "d1""#))
        .stdout(contains(r#""sample_count": 5"#));
    Ok(())
}

#[test]
fn removed_datasets_cannot_be_queried() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    cli(&warehouse)
        .args(["remove", "seals"])
        .assert()
        .success()
        .stdout(contains("Removed dataset seals"));
    cli(&warehouse)
        .args(["data", "seals"])
        .assert()
        .failure()
        .stderr(contains("not found"));
    cli(&warehouse)
        .args(["reconcile"])
        .assert()
        .success()
        .stdout(contains("(no inconsistencies)"));
    Ok(())
}

#[test]
fn bad_requests_fail_with_a_message() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    cli(&warehouse)
        .args(["data", "seals", "--frequency", "0"])
        .assert()
        .failure()
        .stderr(contains("Invalid request"));

    let mixed = tmp.path().join("mixed.csv");
    std::fs::write(
        &mixed,
        "datetime,label,value\n\
         2024-01-01T00:00:00Z,state,1.0\n\
         2024-01-01T00:00:01Z,state,diving\n",
    )?;
    cli(&warehouse)
        .args(["ingest-csv", "seals", "--animal", "a", "--deployment", "d", "--csv"])
        .arg(&mixed)
        .assert()
        .failure()
        .stderr(contains("Schema mismatch"));
    Ok(())
}

#[test]
fn cache_can_be_cleared() -> TestResult {
    let tmp = TempDir::new()?;
    let warehouse = tmp.path().join("lake");
    init_and_ingest(&warehouse, tmp.path())?;

    cli(&warehouse).args(["data", "seals"]).assert().success();
    cli(&warehouse).args(["events", "seals"]).assert().success().stdout(contains("(no rows)"));
    cli(&warehouse)
        .args(["cache", "clear", "--method", "get_data"])
        .assert()
        .success()
        .stdout(contains("Removed 1 cache entries"));
    cli(&warehouse)
        .args(["cache", "cleanup"])
        .assert()
        .success()
        .stdout(contains("Removed 0 cache entries"));
    Ok(())
}
