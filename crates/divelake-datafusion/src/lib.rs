//! DataFusion integration for `divelake-core`.
//!
//! This crate keeps all DataFusion types out of `divelake-core`. The main
//! entry point is [`LakeTableProvider`], which exposes one pinned table
//! snapshot to a `SessionContext` with file pruning on partition values and
//! time bounds.
#![deny(missing_docs)]

mod lake_table_provider;
pub use lake_table_provider::LakeTableProvider;
