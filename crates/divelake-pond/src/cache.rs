//! File-backed query result cache.
//!
//! Entries live as `<digest>.entry` files in one directory, each stamped with
//! its creation time and TTL class. Reads treat an expired entry as absent and
//! delete it; undecodable entries are deleted too. Every failure inside the
//! cache is logged and swallowed: a broken cache slows requests down but never
//! fails them. Writes replace entries atomically, so concurrent writers of the
//! same key leave the last complete entry behind.
//!
//! The directory holds nothing but derived data and may be deleted at any
//! time.

mod entry;
mod key;

use std::{
    future::Future,
    path::{Path, PathBuf},
};

use arrow::error::ArrowError;
use chrono::{TimeDelta, Utc};
use divelake_core::storage::{self, StorageError, StorageLocation};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};

pub use entry::{CachePayload, PayloadFormat};
pub use key::CacheKey;

use entry::EntryHeader;

const ENTRY_SUFFIX: &str = ".entry";

/// Errors raised inside the cache. Never surfaced by query methods.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CacheError {
    /// Reading, writing or listing entries failed.
    #[snafu(display("Cache storage error: {source}"))]
    Storage {
        /// Underlying storage error.
        #[snafu(backtrace)]
        source: StorageError,
    },

    /// Listing or deleting in the cache directory failed.
    #[snafu(display("Cache I/O error at {}: {source}", path.display()))]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// JSON header or payload could not be (de)serialized.
    #[snafu(display("Cache JSON error: {source}"))]
    Json {
        /// Underlying serde error.
        source: serde_json::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Arrow IPC payload could not be (de)serialized.
    #[snafu(display("Cache Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The file is not a cache entry of this version.
    #[snafu(display("Corrupt cache entry: {reason}"))]
    CorruptEntry {
        /// What is wrong.
        reason: String,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Expiry class of a cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Channel catalogs, channel metadata and timezone lookups.
    Metadata,
    /// Event queries and size estimates.
    Events,
    /// Bulk signal queries.
    Signal,
    /// Dataset and deployment listings.
    Enumeration,
}

impl TtlClass {
    /// Default lifetime of entries of this class.
    pub fn default_ttl(self) -> TimeDelta {
        match self {
            TtlClass::Metadata => TimeDelta::hours(1),
            TtlClass::Events => TimeDelta::minutes(5),
            TtlClass::Signal => TimeDelta::days(1),
            TtlClass::Enumeration => TimeDelta::minutes(5),
        }
    }
}

/// Lifetimes per [`TtlClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    metadata: TimeDelta,
    events: TimeDelta,
    signal: TimeDelta,
    enumeration: TimeDelta,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            metadata: TtlClass::Metadata.default_ttl(),
            events: TtlClass::Events.default_ttl(),
            signal: TtlClass::Signal.default_ttl(),
            enumeration: TtlClass::Enumeration.default_ttl(),
        }
    }
}

impl TtlPolicy {
    /// Lifetime of `class`.
    pub fn ttl(&self, class: TtlClass) -> TimeDelta {
        match class {
            TtlClass::Metadata => self.metadata,
            TtlClass::Events => self.events,
            TtlClass::Signal => self.signal,
            TtlClass::Enumeration => self.enumeration,
        }
    }

    /// Override the lifetime of `class`.
    pub fn with_ttl(mut self, class: TtlClass, ttl: TimeDelta) -> Self {
        match class {
            TtlClass::Metadata => self.metadata = ttl,
            TtlClass::Events => self.events = ttl,
            TtlClass::Signal => self.signal = ttl,
            TtlClass::Enumeration => self.enumeration = ttl,
        }
        self
    }
}

/// Keyed, TTL-stamped result cache in a local directory.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    dir: PathBuf,
    location: StorageLocation,
    policy: TtlPolicy,
}

impl CacheLayer {
    /// Cache rooted at `dir` with default lifetimes. The directory is created
    /// on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_policy(dir, TtlPolicy::default())
    }

    /// Cache rooted at `dir` with explicit lifetimes.
    pub fn with_policy(dir: impl Into<PathBuf>, policy: TtlPolicy) -> Self {
        let dir = dir.into();
        Self {
            location: StorageLocation::local(&dir),
            dir,
            policy,
        }
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lifetimes in effect.
    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// With `use_cache == false` the cache is neither read nor written.
    /// Errors of `compute` are returned unchanged and never cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_class: TtlClass,
        use_cache: bool,
        compute: F,
    ) -> Result<T, E>
    where
        T: CachePayload,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !use_cache {
            return compute().await;
        }

        let digest = key.digest();
        if let Some(hit) = self.load::<T>(&digest).await {
            log::debug!("cache hit for {} ({digest})", key.method());
            return Ok(hit);
        }
        log::debug!("cache miss for {} ({digest})", key.method());

        let value = compute().await?;
        if let Err(e) = self.store(key, &digest, ttl_class, &value).await {
            log::warn!("failed to cache result of {}: {e}", key.method());
        }
        Ok(value)
    }

    /// Remove every entry, or only those written by `method`.
    ///
    /// Returns the number of entries removed.
    pub async fn clear(&self, method: Option<&str>) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.entry_paths().await? {
            if let Some(method) = method {
                match self.read_header(&path).await {
                    Ok(header) if header.method == method => {}
                    _ => continue,
                }
            }
            if self.remove(&path).await {
                removed += 1;
            }
        }
        log::info!("cleared {removed} cache entries from {}", self.dir.display());
        Ok(removed)
    }

    /// Delete expired and undecodable entries. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.entry_paths().await? {
            let stale = match self.read_header(&path).await {
                Ok(header) => self.is_expired(&header),
                Err(CacheError::Storage {
                    source: StorageError::NotFound { .. },
                }) => continue,
                Err(_) => true,
            };
            if stale && self.remove(&path).await {
                removed += 1;
            }
        }
        log::debug!("removed {removed} stale cache entries");
        Ok(removed)
    }

    fn is_expired(&self, header: &EntryHeader) -> bool {
        Utc::now() - header.created_at >= self.policy.ttl(header.ttl_class)
    }

    async fn load<T: CachePayload>(&self, digest: &str) -> Option<T> {
        let rel = entry_file_name(digest);
        let bytes = match storage::read_all_bytes(&self.location, Path::new(&rel)).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound { .. }) => return None,
            Err(e) => {
                log::warn!("cannot read cache entry {rel}: {e}");
                return None;
            }
        };

        let path = self.dir.join(&rel);
        let decoded = entry::decode(&bytes).and_then(|(header, payload)| {
            ensure!(
                header.format == T::FORMAT,
                CorruptEntrySnafu {
                    reason: format!("payload is {:?}, expected {:?}", header.format, T::FORMAT),
                }
            );
            Ok((header, payload))
        });
        let (header, payload) = match decoded {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("discarding corrupt cache entry {}: {e}", path.display());
                self.remove(&path).await;
                return None;
            }
        };

        if self.is_expired(&header) {
            log::debug!("cache entry {rel} of {} expired", header.method);
            self.remove(&path).await;
            return None;
        }

        match T::decode(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("discarding undecodable cache entry {}: {e}", path.display());
                self.remove(&path).await;
                None
            }
        }
    }

    async fn store<T: CachePayload>(
        &self,
        key: &CacheKey,
        digest: &str,
        ttl_class: TtlClass,
        value: &T,
    ) -> Result<(), CacheError> {
        let header = EntryHeader::new(key.method(), ttl_class, T::FORMAT);
        let bytes = entry::encode(&header, &value.encode()?)?;
        storage::write_atomic(&self.location, Path::new(&entry_file_name(digest)), &bytes)
            .await
            .context(StorageSnafu)
    }

    async fn read_header(&self, path: &Path) -> Result<EntryHeader, CacheError> {
        let rel = path.strip_prefix(&self.dir).unwrap_or(path);
        let bytes = storage::read_all_bytes(&self.location, rel)
            .await
            .context(StorageSnafu)?;
        entry::decode(&bytes).map(|(header, _)| header)
    }

    async fn entry_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(source).context(IoSnafu {
                    path: self.dir.clone(),
                });
            }
        };

        let mut paths = Vec::new();
        while let Some(item) = dir.next_entry().await.context(IoSnafu {
            path: self.dir.clone(),
        })? {
            let path = item.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ENTRY_SUFFIX) && !n.starts_with('.'))
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn remove(&self, path: &Path) -> bool {
        match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("cannot remove cache entry {}: {e}", path.display());
                false
            }
        }
    }
}

fn entry_file_name(digest: &str) -> String {
    format!("{digest}{ENTRY_SUFFIX}")
}
