//! Storage backends and byte-level I/O helpers.
//!
//! Every higher layer (catalog, commit log, data files) goes through the
//! functions in this module with a [`StorageLocation`] and a *relative* path.
//! Two backends are supported:
//!
//! - the local filesystem, where atomic replacement is write-temp-then-rename
//!   and create-new semantics map onto `O_CREAT | O_EXCL`;
//! - an S3-compatible object store, where single-object puts are atomic and
//!   create-new semantics map onto conditional puts (`PutMode::Create`).
//!
//! Paths inside this module are always relative to the location root so that
//! layout conventions (see [`layout`]) stay backend-agnostic.

/// Storage error types.
pub mod error;
pub mod layout;

use std::{
    fmt,
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{ObjectStore, PutMode, PutPayload, path::Path as ObjectPath};
use snafu::prelude::*;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

pub use error::{BackendError, StorageError};
use error::OtherIoSnafu;

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A location inside an object store bucket.
#[derive(Clone, Debug)]
pub struct RemoteLocation {
    store: Arc<dyn ObjectStore>,
    url: String,
    prefix: Vec<String>,
}

impl RemoteLocation {
    /// Wrap an object store, with `url` naming the bucket root (for example
    /// `s3://my-bucket`) and `prefix` a `/`-separated key prefix.
    pub fn new(store: Arc<dyn ObjectStore>, url: impl Into<String>, prefix: &str) -> Self {
        Self {
            store,
            url: url.into().trim_end_matches('/').to_string(),
            prefix: split_segments(prefix),
        }
    }

    /// The underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Bucket root URL, without the key prefix.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn object_path(&self, rel: &Path) -> ObjectPath {
        let mut segments = self.prefix.clone();
        segments.extend(rel_segments(rel));
        ObjectPath::from_iter(segments.iter().map(String::as_str))
    }
}

/// Root of a storage area: a warehouse, a dataset or a single table.
#[derive(Clone, Debug)]
pub enum StorageLocation {
    /// A directory on the local filesystem.
    Local(PathBuf),
    /// A key prefix inside an object store bucket.
    Remote(RemoteLocation),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// A location nested `rel` below this one.
    pub fn join(&self, rel: impl AsRef<Path>) -> Self {
        match self {
            StorageLocation::Local(root) => StorageLocation::Local(root.join(rel)),
            StorageLocation::Remote(remote) => {
                let mut nested = remote.clone();
                nested.prefix.extend(rel_segments(rel.as_ref()));
                StorageLocation::Remote(nested)
            }
        }
    }

    /// Whether this location lives on the local filesystem.
    pub fn is_local(&self) -> bool {
        matches!(self, StorageLocation::Local(_))
    }

    fn describe(&self, rel: &Path) -> String {
        match self {
            StorageLocation::Local(root) => root.join(rel).display().to_string(),
            StorageLocation::Remote(remote) => {
                format!("{}/{}", remote.url, remote.object_path(rel))
            }
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe(Path::new("")).trim_end_matches('/'))
    }
}

fn split_segments(prefix: &str) -> Vec<String> {
    prefix
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn rel_segments(rel: &Path) -> Vec<String> {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are already on an error path.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `rel_path` inside `location`, replacing any existing
/// object atomically.
///
/// On the local filesystem this writes a uniquely named temporary file next to
/// the target, syncs it, and renames it into place. Concurrent writers to the
/// same path never observe a torn file; the last rename wins. Object store
/// puts are atomic per object.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_path);
            create_parent_dir(&abs).await?;

            let tmp_path = temp_sibling(&abs);
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();
            Ok(())
        }
        StorageLocation::Remote(remote) => {
            let path = remote.object_path(rel_path);
            remote
                .store
                .put(&path, PutPayload::from(Bytes::copy_from_slice(contents)))
                .await
                .map_err(|e| StorageError::from_object_store(location.describe(rel_path), e))?;
            Ok(())
        }
    }
}

fn temp_sibling(abs: &Path) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}-{nanos}.tmp", std::process::id()))
}

/// Create a *new* object at `rel_path` and write `contents`, failing with
/// [`StorageError::AlreadyExists`] if it already exists.
///
/// This is the commit-file guard of the transaction log: exactly one writer
/// can create a given version.
pub async fn write_new(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_path);
            create_parent_dir(&abs).await?;
            let path_str = abs.display().to_string();

            // Atomic "create only if not exists" on the target path.
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&abs)
                .await
                .map_err(|e| StorageError::from_local(path_str.clone(), e))?;

            file.write_all(contents)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: path_str.clone(),
                })?;

            file.sync_all()
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu { path: path_str })?;

            Ok(())
        }
        StorageLocation::Remote(remote) => {
            let path = remote.object_path(rel_path);
            remote
                .store
                .put_opts(
                    &path,
                    PutPayload::from(Bytes::copy_from_slice(contents)),
                    PutMode::Create.into(),
                )
                .await
                .map_err(|e| StorageError::from_object_store(location.describe(rel_path), e))?;
            Ok(())
        }
    }
}

/// Object store URL and key of `rel_path`, for readers that resolve files
/// through an object store registry.
///
/// Local locations map onto the `file://` store backed by the filesystem
/// root; remote ones onto the bucket URL of the location.
pub fn object_location(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<(String, ObjectPath)> {
    match location {
        StorageLocation::Local(root) => {
            let full = root.join(rel_path);
            let absolute = std::path::absolute(&full)
                .map_err(|e| StorageError::from_local(full.display().to_string(), e))?;
            let segments = rel_segments(&absolute);
            Ok(("file://".to_string(), ObjectPath::from_iter(segments.iter().map(String::as_str))))
        }
        StorageLocation::Remote(remote) => Ok((remote.url.clone(), remote.object_path(rel_path))),
    }
}

/// Read the full contents of `rel_path` as bytes.
///
/// Missing objects produce [`StorageError::NotFound`].
pub async fn read_all_bytes(location: &StorageLocation, rel_path: &Path) -> StorageResult<Bytes> {
    match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_path);
            fs::read(&abs)
                .await
                .map(Bytes::from)
                .map_err(|e| StorageError::from_local(abs.display().to_string(), e))
        }
        StorageLocation::Remote(remote) => {
            let path = remote.object_path(rel_path);
            let describe = || location.describe(rel_path);
            let result = remote
                .store
                .get(&path)
                .await
                .map_err(|e| StorageError::from_object_store(describe(), e))?;
            result
                .bytes()
                .await
                .map_err(|e| StorageError::from_object_store(describe(), e))
        }
    }
}

/// Read the object at `rel_path` and decode it as UTF-8.
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    let bytes = read_all_bytes(location, rel_path).await?;
    String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::OtherIo {
        path: location.describe(rel_path),
        source: BackendError::Local(io::Error::new(io::ErrorKind::InvalidData, e)),
        backtrace: snafu::Backtrace::capture(),
    })
}

/// Whether an object (or, locally, any file or directory) exists at `rel_path`.
pub async fn exists(location: &StorageLocation, rel_path: &Path) -> StorageResult<bool> {
    match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_path);
            fs::try_exists(&abs)
                .await
                .map_err(|e| StorageError::from_local(abs.display().to_string(), e))
        }
        StorageLocation::Remote(remote) => {
            let path = remote.object_path(rel_path);
            match remote.store.head(&path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(StorageError::from_object_store(
                    location.describe(rel_path),
                    e,
                )),
            }
        }
    }
}

/// List the names of the immediate child directories of `rel_dir`.
///
/// A missing directory lists as empty. Names are returned sorted.
pub async fn list_child_dirs(
    location: &StorageLocation,
    rel_dir: &Path,
) -> StorageResult<Vec<String>> {
    let mut names = match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_dir);
            let path_str = abs.display().to_string();
            let mut entries = match fs::read_dir(&abs).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::from_local(path_str, e)),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::from_local(path_str.clone(), e))?
            {
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|t| t.is_dir())
                    .unwrap_or(false);
                if is_dir {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names
        }
        StorageLocation::Remote(remote) => {
            let prefix = remote.object_path(rel_dir);
            let listing = remote
                .store
                .list_with_delimiter(Some(&prefix))
                .await
                .map_err(|e| StorageError::from_object_store(location.describe(rel_dir), e))?;
            listing
                .common_prefixes
                .iter()
                .filter_map(|p| p.filename().map(str::to_string))
                .collect()
        }
    };

    names.sort();
    Ok(names)
}

/// Recursively delete everything under `rel_dir`. Deleting a missing
/// directory is not an error.
pub async fn remove_all(location: &StorageLocation, rel_dir: &Path) -> StorageResult<()> {
    match location {
        StorageLocation::Local(root) => {
            let abs = root.join(rel_dir);
            match fs::remove_dir_all(&abs).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::from_local(abs.display().to_string(), e)),
            }
        }
        StorageLocation::Remote(remote) => {
            let prefix = remote.object_path(rel_dir);
            let describe = || location.describe(rel_dir);
            let objects: Vec<_> = remote
                .store
                .list(Some(&prefix))
                .try_collect()
                .await
                .map_err(|e| StorageError::from_object_store(describe(), e))?;

            for meta in objects {
                match remote.store.delete(&meta.location).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => return Err(StorageError::from_object_store(describe(), e)),
                }
            }
            Ok(())
        }
    }
}
