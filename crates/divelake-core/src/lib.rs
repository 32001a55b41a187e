//! Storage layer of the DiveLake biologging lake.
//!
//! This crate owns everything that touches bytes at rest:
//!
//! - [`config`]: resolving a warehouse to exactly one storage backend (local
//!   filesystem or S3-compatible object storage).
//! - [`storage`]: backend-agnostic byte I/O with atomic replace and
//!   create-only-if-absent primitives, plus the on-disk layout conventions.
//! - [`transaction_log`]: a Delta-inspired, append-only commit log with
//!   optimistic concurrency, replayed into immutable table snapshots.
//! - [`lake_table`]: the two physical tables of a dataset (`data` and
//!   `events`) with fixed schemas and hive-partitioned Parquet files.
//! - [`catalog`]: the bookkeeping document tracking dataset lifecycle state.
//!
//! Query planning lives in `divelake-datafusion` and `divelake-pond`, which
//! depend on this crate rather than re-implementing storage logic.
#![deny(missing_docs)]
pub mod catalog;
pub mod config;
pub mod lake_table;
pub mod storage;
pub mod transaction_log;
