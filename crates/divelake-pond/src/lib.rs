//! Query, resampling and caching engine over a DiveLake warehouse.
//!
//! A warehouse holds datasets; each dataset owns a `data` table of signal
//! readings and an `events` table, stored by `divelake-core`. This crate
//! puts an analytics session in front of them:
//!
//! - [`DatasetManager`] creates and removes datasets and keeps one view per
//!   table (`<dataset>_Data`, `<dataset>_Events`) pointed at the latest
//!   committed snapshot.
//! - [`DivePond`] answers reads through those views: filtered signal data,
//!   resampled per label and optionally pivoted, events, channel catalogs,
//!   deployment listings and size estimates. It also accepts writes.
//! - [`CacheLayer`] keeps read results on local disk, keyed by the request
//!   and expired per result class.
//!
//! ```no_run
//! use divelake_core::config::WarehouseConfig;
//! use divelake_pond::{DataRequest, DivePond};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pond = DivePond::open(WarehouseConfig::from_env()?).await?;
//! let request = DataRequest::new().labels(["depth", "temperature"]).frequency(1.0).pivoted(true);
//! let batch = pond.get_data("apfo-2019", &request).await?;
//! println!("{} rows", batch.num_rows());
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod cache;
pub mod channels;
pub mod connection;
pub mod context;
pub mod dataset;
pub mod error;
pub mod metadata;
pub mod pivot;
pub mod pond;
pub mod predicate;
pub mod resample;
pub mod series;

pub use cache::{CacheLayer, TtlClass, TtlPolicy};
pub use channels::{ChannelCatalog, ChannelOptions};
pub use connection::AnalyticsConnection;
pub use context::PondContext;
pub use dataset::{DatasetManager, Finding, Inconsistency};
pub use error::{ErrorKind, PondError, PondResult};
pub use metadata::{ChannelMetadata, MetadataProvider, NoMetadata, StaticMetadata};
pub use pond::{
    DataRequest, DeploymentSummary, DivePond, EventsRequest, SignalMetadata, SignalValue,
};
pub use predicate::{DateRange, FilterValues, Predicate};
