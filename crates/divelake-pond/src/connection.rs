//! The analytics session shared by every query.
//!
//! One [`AnalyticsConnection`] owns one DataFusion [`SessionContext`]. Callers
//! borrow it through [`AnalyticsConnection::acquire`]; the returned scope is
//! a read guard, so any number of queries run concurrently while
//! [`AnalyticsConnection::close`] waits for all of them to finish before
//! releasing the session.

use std::{fmt, sync::Arc};

use datafusion::{
    error::DataFusionError,
    execution::object_store::ObjectStoreUrl,
    prelude::{SessionConfig, SessionContext},
};
use divelake_core::{config::WarehouseConfig, storage::StorageLocation};
use snafu::{Backtrace, prelude::*};
use tokio::sync::{RwLock, RwLockReadGuard};

/// Errors raised while building or borrowing the analytics session.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConnectionError {
    /// The bucket URL could not be registered with the session.
    #[snafu(display("Cannot register object store for {url}: {source}"))]
    ObjectStoreUrl {
        /// Bucket URL that was rejected.
        url: String,
        /// Underlying engine error.
        source: DataFusionError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The session was closed by [`AnalyticsConnection::close`].
    #[snafu(display("The analytics connection is closed"))]
    Closed {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// A borrowed session, valid until dropped.
pub type ConnectionScope<'a> = RwLockReadGuard<'a, SessionContext>;

/// Owner of the analytics session.
pub struct AnalyticsConnection {
    session: RwLock<Option<SessionContext>>,
    object_storage: bool,
}

impl fmt::Debug for AnalyticsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let closed = self.session.try_read().map(|s| s.is_none()).ok();
        f.debug_struct("AnalyticsConnection")
            .field("closed", &closed)
            .field("object_storage", &self.object_storage)
            .finish()
    }
}

impl AnalyticsConnection {
    /// Build a session able to read tables stored at `warehouse`.
    ///
    /// When the warehouse lives in object storage the bucket's client is
    /// registered with the session runtime, so SQL issued through
    /// [`crate::DivePond::run_sql`] can address `s3://` URLs with the
    /// configured credentials. Local warehouses need no registration.
    pub fn open(
        config: &WarehouseConfig,
        warehouse: &StorageLocation,
    ) -> Result<Self, ConnectionError> {
        // Scans keep one partition per data file in commit order; neither
        // file splitting nor round-robin shuffles may reorder them.
        let session_config = SessionConfig::new()
            .with_information_schema(true)
            .with_default_catalog_and_schema("divelake", "public")
            .with_repartition_file_scans(false)
            .with_round_robin_repartition(false);
        let ctx = SessionContext::new_with_config(session_config);

        if let StorageLocation::Remote(remote) = warehouse {
            let url = ObjectStoreUrl::parse(remote.url()).context(ObjectStoreUrlSnafu {
                url: remote.url().to_string(),
            })?;
            ctx.register_object_store(url.as_ref(), Arc::clone(remote.store()));
            log::info!("registered object store {} with the analytics session", remote.url());
        }

        log::debug!("analytics session ready for {}", config.warehouse_uri());
        Ok(Self {
            session: RwLock::new(Some(ctx)),
            object_storage: config.uses_object_storage(),
        })
    }

    /// Borrow the session for the duration of one query or transaction.
    pub async fn acquire(&self) -> Result<ConnectionScope<'_>, ConnectionError> {
        let guard = self.session.read().await;
        RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| ClosedSnafu.build())
    }

    /// Whether the session reads from object storage.
    pub fn uses_object_storage(&self) -> bool {
        self.object_storage
    }

    /// Whether [`Self::close`] has run.
    pub async fn is_closed(&self) -> bool {
        self.session.read().await.is_none()
    }

    /// Release the session once every outstanding scope is dropped.
    ///
    /// Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let released = self.session.write().await.take();
        if released.is_some() {
            log::info!("analytics session closed");
        }
        released.is_some()
    }
}
