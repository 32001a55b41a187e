//! Process-wide handles, built once and passed to the engine.

use std::sync::Arc;

use divelake_core::{catalog::CatalogManager, config::WarehouseConfig};
use snafu::prelude::*;

use crate::{
    cache::CacheLayer,
    connection::AnalyticsConnection,
    error::{CatalogSnafu, EngineInitSnafu, PondResult},
    metadata::{MetadataProvider, NoMetadata},
};

/// Everything a [`crate::DivePond`] needs to reach the warehouse.
///
/// Built once at startup from a [`WarehouseConfig`]. The catalog and the
/// analytics session are shared handles, so a context can also back a
/// standalone [`crate::DatasetManager`].
#[derive(Debug, Clone)]
pub struct PondContext {
    config: WarehouseConfig,
    catalog: Arc<CatalogManager>,
    connection: Arc<AnalyticsConnection>,
    cache: CacheLayer,
    metadata: Arc<dyn MetadataProvider>,
}

impl PondContext {
    /// Open the catalog and the analytics session for `config`.
    ///
    /// The cache lives in the configured cache directory and no metadata
    /// collaborator is attached.
    pub async fn open(config: WarehouseConfig) -> PondResult<Self> {
        let catalog = CatalogManager::open(&config).await.context(CatalogSnafu)?;
        let connection =
            AnalyticsConnection::open(&config, catalog.warehouse()).context(EngineInitSnafu)?;
        log::info!(
            "opened warehouse {} ({} backend)",
            catalog.warehouse_uri(),
            if connection.uses_object_storage() { "object storage" } else { "local" }
        );

        Ok(Self {
            cache: CacheLayer::new(config.cache_dir()),
            config,
            catalog: Arc::new(catalog),
            connection: Arc::new(connection),
            metadata: Arc::new(NoMetadata),
        })
    }

    /// Replace the metadata collaborator.
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replace the query cache.
    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = cache;
        self
    }

    /// Resolved configuration.
    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Catalog handle.
    pub fn catalog(&self) -> &Arc<CatalogManager> {
        &self.catalog
    }

    /// Analytics session handle.
    pub fn connection(&self) -> &Arc<AnalyticsConnection> {
        &self.connection
    }

    /// Query cache.
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Metadata collaborator.
    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }
}
