//! src/services/object_store.rs
//!
//! FsObjectStore — the object-store capability (put, get, exists, delete)
//! backed by local disk under `base_path/{key}`. Keys come from the
//! deterministic scheme in `crate::keys`, so the directory layout mirrors the
//! logical namespace and both the creation path and the transform worker can
//! address objects without coordination.

use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata returned after a successful put.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub key: String,
    pub etag: String,
    pub size_bytes: u64,
}

/// Disk-backed object store.
///
/// Writes are durable and overwrite-safe: bytes land in a temp file that is
/// fsynced and atomically renamed over the final path. Re-putting the same
/// key is therefore always safe, which is what the at-least-once transform
/// trigger relies on.
#[derive(Clone)]
pub struct FsObjectStore {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl FsObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`. Keys produced by the
    /// key scheme always pass; this guards the raw-key surfaces (media route,
    /// event notifications).
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Physical path for a key. Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path
    }

    /// Write a byte buffer under `key`.
    ///
    /// - Writes to a temporary file next to the final location.
    /// - Computes the MD5 etag while writing.
    /// - Fsyncs, then atomically renames into place (overwrites).
    pub async fn put(&self, key: &str, bytes: &[u8]) -> StoreResult<StoredObject> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut file = File::create(&tmp_path).await?;
        let write_result = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let etag = format!("{:x}", md5::compute(bytes));
        debug!(key, size = bytes.len(), %etag, "stored object");
        Ok(StoredObject {
            key: key.to_string(),
            etag,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Read a whole object into memory.
    pub async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::read(&file_path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Open an object for streaming out; returns the handle and its length.
    pub async fn reader(&self, key: &str) -> StoreResult<(File, u64)> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// True when an object exists under `key`. This is the authoritative
    /// "variant present" check — never a count comparison.
    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Delete an object. Idempotent: a missing object is not an error, so
    /// deleting a post whose variants never materialized cannot fail.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed object {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("object {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the store root.
    ///
    /// Stops when a directory is not empty, not found, or the root is reached.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_exists_roundtrip() {
        let (_dir, store) = store();
        let key = "posts/owner/post/original.jpeg";

        assert!(!store.exists(key).await.unwrap());
        let stored = store.put(key, b"payload").await.unwrap();
        assert_eq!(stored.size_bytes, 7);
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let (_dir, store) = store();
        let key = "posts/owner/post/t1.jpg";
        store.put(key, b"first").await.unwrap();
        store.put(key, b"second").await.unwrap();
        assert_eq!(store.get(key).await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (_dir, store) = store();
        let key = "posts/owner/post/thumb.jpg";
        store.put(key, b"bytes").await.unwrap();
        store.delete(key).await.unwrap();
        // Second delete of a now-missing object must not fail.
        store.delete(key).await.unwrap();
        assert!(!store.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (_dir, store) = store();
        for key in ["/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                store.put(key, b"x").await,
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[tokio::test]
    async fn missing_object_reads_as_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("posts/a/b/t9.jpg").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
