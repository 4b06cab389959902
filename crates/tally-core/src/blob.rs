//! Blob store abstraction.
//!
//! A blob store holds objects in named buckets. The engines only need to list
//! objects with their timestamps, copy an object from one bucket to another,
//! and delete objects. Timestamps are reported at millisecond precision so
//! they compare cleanly with what the document store holds.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::model::{now_millis, truncate_to_millis};

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    /// Object path within its bucket.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// When the object was created.
    pub created_at: DateTime<Utc>,
    /// When the object was last written.
    pub updated_at: DateTime<Utc>,
}

/// Blob store trait.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Lists objects in `bucket` whose path starts with `prefix`.
    ///
    /// An empty prefix lists the whole bucket. A missing bucket lists as empty.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>>;

    /// Copies `path` from `src_bucket` into `dst_bucket` under the same path.
    ///
    /// Returns [`Error::NotFound`] if the source object is missing.
    async fn copy(&self, src_bucket: &str, path: &str, dst_bucket: &str) -> Result<()>;

    /// Deletes `path` from `bucket`. Deleting a missing object succeeds.
    async fn delete(&self, bucket: &str, path: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

type Buckets = HashMap<String, BTreeMap<String, StoredBlob>>;

/// In-memory blob store for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default, Clone)]
pub struct MemoryBlobStore {
    buckets: Arc<RwLock<Buckets>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes an object stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put(&self, bucket: &str, path: &str, data: impl Into<Bytes>) -> Result<()> {
        let now = now_millis();
        self.put_at(bucket, path, data, now, now)
    }

    /// Writes an object with explicit timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_at(
        &self,
        bucket: &str,
        path: &str,
        data: impl Into<Bytes>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.buckets
            .write()
            .map_err(poison_err)?
            .entry(bucket.to_string())
            .or_default()
            .insert(
                path.to_string(),
                StoredBlob {
                    data: data.into(),
                    created_at: truncate_to_millis(created_at),
                    updated_at: truncate_to_millis(updated_at),
                },
            );
        Ok(())
    }

    /// Returns true if the object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn contains(&self, bucket: &str, path: &str) -> Result<bool> {
        let buckets = self.buckets.read().map_err(poison_err)?;
        Ok(buckets.get(bucket).is_some_and(|b| b.contains_key(path)))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>> {
        let buckets = self.buckets.read().map_err(poison_err)?;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| BlobMeta {
                path: path.clone(),
                size: blob.data.len() as u64,
                created_at: blob.created_at,
                updated_at: blob.updated_at,
            })
            .collect())
    }

    async fn copy(&self, src_bucket: &str, path: &str, dst_bucket: &str) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(poison_err)?;
        let data = buckets
            .get(src_bucket)
            .and_then(|b| b.get(path))
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {src_bucket}/{path}")))?;

        // A copy is a fresh write in the destination.
        let now = now_millis();
        buckets.entry(dst_bucket.to_string()).or_default().insert(
            path.to_string(),
            StoredBlob {
                data,
                created_at: now,
                updated_at: now,
            },
        );
        drop(buckets);
        Ok(())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        if let Some(objects) = self.buckets.write().map_err(poison_err)?.get_mut(bucket) {
            objects.remove(path);
        }
        Ok(())
    }
}

/// Blob store on the local filesystem.
///
/// Each bucket is a directory under `root`; object paths map onto nested
/// files. Creation time falls back to modification time on filesystems that
/// do not record it.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || !is_plain_relative(Path::new(bucket)) || bucket.contains('/') {
            return Err(Error::InvalidInput(format!("invalid bucket name '{bucket}'")));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf> {
        if path.is_empty() || !is_plain_relative(Path::new(path)) {
            return Err(Error::InvalidInput(format!("invalid object path '{path}'")));
        }
        Ok(self.bucket_dir(bucket)?.join(path))
    }
}

/// True if `path` only has normal components (no root, `.` or `..`).
fn is_plain_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn io_err(context: String, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        return Error::NotFound(context);
    }
    Error::storage_with_source(context, err)
}

fn list_dir(dir: &Path, prefix: &str) -> Result<Vec<BlobMeta>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut objects = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| Error::storage_with_source(format!("walk {}", dir.display()), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let Some(path) = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .map(|segments| segments.join("/"))
        else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 object path");
            continue;
        };
        if !path.starts_with(prefix) {
            continue;
        }

        let metadata = entry
            .metadata()
            .map_err(|e| Error::storage_with_source(format!("stat {}", entry.path().display()), e))?;
        let updated_at: DateTime<Utc> = metadata
            .modified()
            .map_err(|e| io_err(format!("mtime of {}", entry.path().display()), e))?
            .into();
        let created_at: DateTime<Utc> = metadata.created().map_or(updated_at, Into::into);

        objects.push(BlobMeta {
            path,
            size: metadata.len(),
            created_at: truncate_to_millis(created_at),
            updated_at: truncate_to_millis(updated_at),
        });
    }
    objects.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(objects)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<BlobMeta>> {
        let dir = self.bucket_dir(bucket)?;
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || list_dir(&dir, &prefix))
            .await
            .map_err(|e| Error::Internal {
                message: format!("listing task failed: {e}"),
            })?
    }

    async fn copy(&self, src_bucket: &str, path: &str, dst_bucket: &str) -> Result<()> {
        let src = self.object_path(src_bucket, path)?;
        let dst = self.object_path(dst_bucket, path)?;

        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(format!("create {}", parent.display()), e))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| io_err(format!("copy {src_bucket}/{path} to {dst_bucket}"), e))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, path: &str) -> Result<()> {
        let target = self.object_path(bucket, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(format!("delete {bucket}/{path}"), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_list_respects_prefix() {
        let store = MemoryBlobStore::new();
        store.put("primary", "a/1", "x").unwrap();
        store.put("primary", "a/2", "yy").unwrap();
        store.put("primary", "ab/1", "z").unwrap();

        let listed = store.list("primary", "a/").await.unwrap();
        let paths: Vec<_> = listed.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["a/1", "a/2"]);
        assert_eq!(listed[1].size, 2);

        assert_eq!(store.list("primary", "").await.unwrap().len(), 3);
        assert!(store.list("missing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_copy_refreshes_timestamps() {
        let store = MemoryBlobStore::new();
        let old = DateTime::from_timestamp_millis(1_000).unwrap();
        store.put_at("primary", "a/1", "data", old, old).unwrap();

        store.copy("primary", "a/1", "backup").await.unwrap();
        let backup = store.list("backup", "").await.unwrap();
        assert_eq!(backup.len(), 1);
        assert!(backup[0].updated_at > old);

        let err = store.copy("primary", "a/missing", "backup").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn memory_delete_is_idempotent() {
        let store = MemoryBlobStore::new();
        store.put("backup", "a/1", "x").unwrap();
        store.delete("backup", "a/1").await.unwrap();
        store.delete("backup", "a/1").await.unwrap();
        store.delete("nobucket", "a/1").await.unwrap();
        assert!(!store.contains("backup", "a/1").unwrap());
    }

    #[tokio::test]
    async fn local_store_lists_copies_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let object = dir.path().join("primary/addr/photos/a.jpg");
        std::fs::create_dir_all(object.parent().unwrap()).unwrap();
        std::fs::write(&object, b"12345").unwrap();
        std::fs::write(dir.path().join("primary/addr/b.txt"), b"1").unwrap();

        let listed = store.list("primary", "addr/").await.unwrap();
        let paths: Vec<_> = listed.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["addr/b.txt", "addr/photos/a.jpg"]);
        assert_eq!(listed[1].size, 5);
        assert_eq!(listed[1].updated_at, truncate_to_millis(listed[1].updated_at));

        store.copy("primary", "addr/photos/a.jpg", "backup").await.unwrap();
        let backup = store.list("backup", "").await.unwrap();
        assert_eq!(backup.len(), 1);
        assert_eq!(backup[0].path, "addr/photos/a.jpg");

        store.delete("backup", "addr/photos/a.jpg").await.unwrap();
        store.delete("backup", "addr/photos/a.jpg").await.unwrap();
        assert!(store.list("backup", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        assert!(store.delete("primary", "../etc/passwd").await.is_err());
        assert!(store.delete("..", "a/1").await.is_err());
        assert!(store.copy("primary", "/abs", "backup").await.is_err());
        assert!(matches!(
            store.copy("primary", "a/missing", "backup").await,
            Err(Error::NotFound(_))
        ));
    }
}
