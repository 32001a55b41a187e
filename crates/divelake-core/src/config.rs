//! Warehouse configuration: which storage backend holds the lake.
//!
//! A [`WarehouseConfig`] describes exactly one backend. Values come from an
//! explicit [`WarehouseConfigBuilder`] first and fall back to environment
//! variables:
//!
//! | Variable               | Meaning                                         |
//! |------------------------|-------------------------------------------------|
//! | `S3_ENDPOINT`          | object storage endpoint (`host[:port]` or URL)  |
//! | `S3_ACCESS_KEY`        | access key id                                   |
//! | `S3_SECRET_KEY`        | secret access key                               |
//! | `S3_BUCKET`            | bucket name                                     |
//! | `S3_REGION`            | region, default `us-east-1`                     |
//! | `DIVELAKE_WAREHOUSE`   | local warehouse root                            |
//! | `DIVELAKE_CATALOG_DIR` | catalog bookkeeping dir for the S3 backend      |
//! | `DIVELAKE_CACHE_DIR`   | query cache directory                           |
//!
//! Object storage is selected only when endpoint, access key, secret key and
//! bucket are all present; a partial set is rejected rather than silently
//! falling back to the local backend.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use object_store::aws::AmazonS3Builder;
use snafu::{Backtrace, prelude::*};

use crate::storage::{RemoteLocation, StorageLocation};

/// Default local warehouse root, relative to the working directory.
pub const DEFAULT_LOCAL_WAREHOUSE: &str = "local_lake_warehouse";
/// Default object storage region.
pub const DEFAULT_REGION: &str = "us-east-1";
/// Key prefix inside the bucket under which all datasets live.
pub const OBJECT_STORE_WAREHOUSE_PREFIX: &str = "lake-warehouse";

const ENV_ENDPOINT: &str = "S3_ENDPOINT";
const ENV_ACCESS_KEY: &str = "S3_ACCESS_KEY";
const ENV_SECRET_KEY: &str = "S3_SECRET_KEY";
const ENV_BUCKET: &str = "S3_BUCKET";
const ENV_REGION: &str = "S3_REGION";
const ENV_WAREHOUSE: &str = "DIVELAKE_WAREHOUSE";
const ENV_CATALOG_DIR: &str = "DIVELAKE_CATALOG_DIR";
const ENV_CACHE_DIR: &str = "DIVELAKE_CACHE_DIR";

/// Errors raised while resolving a warehouse configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// Some but not all object storage parameters were supplied.
    #[snafu(display(
        "Ambiguous storage backend: object storage parameters {} are missing \
         (supply all of endpoint, access key, secret key and bucket, or none)",
        missing.join(", ")
    ))]
    PartialObjectStorage {
        /// Names of the missing parameters.
        missing: Vec<&'static str>,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A directory could not be resolved to an absolute path.
    #[snafu(display("Cannot resolve {what} path {path:?}: {source}"))]
    UnresolvablePath {
        /// What the path is for ("warehouse", "catalog", "cache").
        what: &'static str,
        /// The raw path that failed to resolve.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// A path parameter was present but empty.
    #[snafu(display("The {what} path is empty"))]
    EmptyPath {
        /// What the path is for.
        what: &'static str,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// No home directory is available for the default catalog location.
    #[snafu(display(
        "No home directory available for the object storage catalog; set {ENV_CATALOG_DIR}"
    ))]
    NoHomeDir {
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// Building the object store client failed.
    #[snafu(display("Invalid object storage settings for bucket {bucket}: {source}"))]
    ObjectStoreClient {
        /// Bucket the client was built for.
        bucket: String,
        /// Underlying object store error.
        source: object_store::Error,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Credentials and addressing for an S3-compatible bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct ObjectStorageConfig {
    /// Endpoint URL, always carrying a scheme.
    pub endpoint: String,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Bucket name.
    pub bucket: String,
    /// Region name.
    pub region: String,
}

impl ObjectStorageConfig {
    /// Whether the endpoint speaks plain HTTP.
    pub fn allow_http(&self) -> bool {
        self.endpoint.starts_with("http://")
    }

    /// Bucket root URL, e.g. `s3://my-bucket`.
    pub fn bucket_url(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

impl fmt::Debug for ObjectStorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStorageConfig")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish()
    }
}

/// The one storage backend a warehouse lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local filesystem, rooted at an absolute directory.
    Local {
        /// Absolute warehouse root.
        root: PathBuf,
    },
    /// S3-compatible object storage.
    ObjectStorage(ObjectStorageConfig),
}

/// Immutable, validated description of where the lake lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    backend: StorageBackend,
    catalog_dir: PathBuf,
    cache_dir: PathBuf,
}

impl WarehouseConfig {
    /// Start an explicit configuration.
    pub fn builder() -> WarehouseConfigBuilder {
        WarehouseConfigBuilder::default()
    }

    /// Resolve a configuration purely from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().build()
    }

    /// A local warehouse rooted at `root`, ignoring object storage variables.
    pub fn local(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::builder()
            .local_path(root)
            .ignore_env(true)
            .build()
    }

    /// The selected backend.
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Local directory holding the catalog bookkeeping file.
    pub fn catalog_dir(&self) -> &Path {
        &self.catalog_dir
    }

    /// Directory for cached query results.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Whether the object storage backend is selected.
    pub fn uses_object_storage(&self) -> bool {
        matches!(self.backend, StorageBackend::ObjectStorage(_))
    }

    /// Human-readable warehouse URI (`/abs/path` or `s3://bucket/lake-warehouse`).
    pub fn warehouse_uri(&self) -> String {
        match &self.backend {
            StorageBackend::Local { root } => root.display().to_string(),
            StorageBackend::ObjectStorage(s3) => {
                format!("{}/{OBJECT_STORE_WAREHOUSE_PREFIX}", s3.bucket_url())
            }
        }
    }

    /// Build the storage location for the warehouse root.
    ///
    /// For object storage this constructs the S3 client; no network request is
    /// made until the first read or write.
    pub fn storage_location(&self) -> Result<StorageLocation, ConfigError> {
        match &self.backend {
            StorageBackend::Local { root } => Ok(StorageLocation::local(root)),
            StorageBackend::ObjectStorage(s3) => {
                let store = AmazonS3Builder::new()
                    .with_endpoint(&s3.endpoint)
                    .with_access_key_id(&s3.access_key)
                    .with_secret_access_key(&s3.secret_key)
                    .with_bucket_name(&s3.bucket)
                    .with_region(&s3.region)
                    .with_virtual_hosted_style_request(false)
                    .with_allow_http(s3.allow_http())
                    .build()
                    .context(ObjectStoreClientSnafu {
                        bucket: s3.bucket.clone(),
                    })?;

                Ok(StorageLocation::Remote(RemoteLocation::new(
                    Arc::new(store),
                    s3.bucket_url(),
                    OBJECT_STORE_WAREHOUSE_PREFIX,
                )))
            }
        }
    }
}

/// Explicit overrides for [`WarehouseConfig`]; unset fields fall back to the
/// environment unless [`WarehouseConfigBuilder::ignore_env`] is set.
#[derive(Debug, Clone, Default)]
pub struct WarehouseConfigBuilder {
    endpoint: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    local_path: Option<PathBuf>,
    catalog_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    ignore_env: bool,
}

impl WarehouseConfigBuilder {
    /// Object storage endpoint, with or without scheme.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Object storage access key id.
    pub fn access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    /// Object storage secret key.
    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    /// Object storage bucket.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Object storage region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Local warehouse root.
    pub fn local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Directory for catalog bookkeeping when using object storage.
    pub fn catalog_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_dir = Some(path.into());
        self
    }

    /// Directory for cached query results.
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Do not consult environment variables for unset fields.
    pub fn ignore_env(mut self, ignore: bool) -> Self {
        self.ignore_env = ignore;
        self
    }

    /// Resolve using the process environment for unset fields.
    pub fn build(self) -> Result<WarehouseConfig, ConfigError> {
        if self.ignore_env {
            self.build_with(|_| None)
        } else {
            self.build_with(|key| std::env::var(key).ok())
        }
    }

    /// Resolve using `lookup` as the environment.
    pub fn build_with<F>(self, lookup: F) -> Result<WarehouseConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |explicit: Option<String>, key: &str| {
            explicit
                .or_else(|| lookup(key))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let pick_path = |explicit: Option<PathBuf>, key: &str| {
            explicit.or_else(|| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        };

        let endpoint = pick(self.endpoint, ENV_ENDPOINT);
        let access_key = pick(self.access_key, ENV_ACCESS_KEY);
        let secret_key = pick(self.secret_key, ENV_SECRET_KEY);
        let bucket = pick(self.bucket, ENV_BUCKET);
        let region = pick(self.region, ENV_REGION).unwrap_or_else(|| DEFAULT_REGION.to_string());

        let cache_override = pick_path(self.cache_dir, ENV_CACHE_DIR);

        let (backend, catalog_dir) = match (endpoint, access_key, secret_key, bucket) {
            (Some(endpoint), Some(access_key), Some(secret_key), Some(bucket)) => {
                let catalog_dir = match pick_path(self.catalog_dir, ENV_CATALOG_DIR) {
                    Some(dir) => resolve_dir("catalog", &dir)?,
                    None => dirs::home_dir()
                        .map(|home| home.join(".divelake"))
                        .context(NoHomeDirSnafu)?,
                };
                let backend = StorageBackend::ObjectStorage(ObjectStorageConfig {
                    endpoint: normalize_endpoint(&endpoint),
                    access_key,
                    secret_key,
                    bucket,
                    region,
                });
                (backend, catalog_dir)
            }
            (None, None, None, None) => {
                let raw = pick_path(self.local_path, ENV_WAREHOUSE)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_WAREHOUSE));
                let root = resolve_dir("warehouse", &raw)?;
                (StorageBackend::Local { root: root.clone() }, root)
            }
            (endpoint, access_key, secret_key, bucket) => {
                let mut missing = Vec::new();
                if endpoint.is_none() {
                    missing.push("endpoint");
                }
                if access_key.is_none() {
                    missing.push("access key");
                }
                if secret_key.is_none() {
                    missing.push("secret key");
                }
                if bucket.is_none() {
                    missing.push("bucket");
                }
                return PartialObjectStorageSnafu { missing }.fail();
            }
        };

        let cache_dir = match cache_override {
            Some(dir) => resolve_dir("cache", &dir)?,
            None => catalog_dir.join(".cache").join("divelake"),
        };

        Ok(WarehouseConfig {
            backend,
            catalog_dir,
            cache_dir,
        })
    }
}

fn normalize_endpoint(raw: &str) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn resolve_dir(what: &'static str, raw: &Path) -> Result<PathBuf, ConfigError> {
    if raw.as_os_str().is_empty() {
        return EmptyPathSnafu { what }.fail();
    }
    if raw.is_absolute() {
        return Ok(raw.to_path_buf());
    }
    let cwd = std::env::current_dir().context(UnresolvablePathSnafu {
        what,
        path: raw.to_path_buf(),
    })?;
    Ok(cwd.join(raw))
}
