//! Durable store abstractions: the small primary snapshot store and the
//! blob store that absorbs oversized fields.
//!
//! Both traits degrade gracefully: callers treat every failure as
//! recoverable (keep data inline, leave a field unresolved, start empty).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from the durable stores
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store is (temporarily) unavailable
    #[error("store unavailable")]
    Unavailable,

    /// Filesystem-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A generic, asynchronous, durable string key-value store for oversized
/// fields.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Batched read. Keys that are absent or individually unreadable are
    /// simply missing from the result; only a whole-store failure errors.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError>;
}

/// The small primary store holding one serialized snapshot.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>, StoreError>;

    async fn save(&self, snapshot: &str) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

// ---- In-memory implementations ----

/// In-memory blob store. The availability switch lets tests exercise the
/// degrade paths.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the store into (or out of) the unavailable state.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.blobs.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.blobs.lock().get(key).cloned())
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        self.check_available()?;
        let blobs = self.blobs.lock();
        Ok(keys
            .iter()
            .filter_map(|k| blobs.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }
}

/// In-memory snapshot store, with a write counter for coalescing tests.
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<String>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load raw contents (e.g. a legacy or corrupt snapshot).
    pub fn preload(&self, raw: impl Into<String>) {
        *self.snapshot.lock() = Some(raw.into());
    }

    /// Number of completed save calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    /// Current contents, for inspection.
    pub fn contents(&self) -> Option<String> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &str) -> Result<(), StoreError> {
        *self.snapshot.lock() = Some(snapshot.to_string());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.snapshot.lock() = None;
        Ok(())
    }
}

// ---- Filesystem implementations ----

/// Blob store keeping one file per key under a directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys contain ':' separators; keep filenames portable.
        self.dir.join(format!("{}.blob", key.replace(':', "_")))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path_for(key), value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, String>, StoreError> {
        let mut found = HashMap::new();
        for key in keys {
            match self.get(key).await {
                Ok(Some(value)) => {
                    found.insert(key.clone(), value);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "blob read failed; leaving field unresolved");
                }
            }
        }
        Ok(found)
    }
}

/// Snapshot store backed by a single JSON file.
pub struct FsSnapshotStore {
    path: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn load(&self) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, snapshot).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_blob_roundtrip_and_batch() {
        let store = MemoryBlobStore::new();
        store.put("a", "1").await.unwrap();
        store.put("b", "2").await.unwrap();

        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("missing").await.unwrap(), None);

        let many = store
            .get_many(&["a".into(), "b".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many["b"], "2");
    }

    #[tokio::test]
    async fn test_memory_blob_unavailable() {
        let store = MemoryBlobStore::new();
        store.set_available(false);
        assert!(matches!(
            store.put("a", "1").await,
            Err(StoreError::Unavailable)
        ));
        store.set_available(true);
        store.put("a", "1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_snapshot_counts_saves() {
        let store = MemorySnapshotStore::new();
        assert_eq!(store.load().await.unwrap(), None);
        store.save("{}").await.unwrap();
        store.save("{}").await.unwrap();
        assert_eq!(store.save_count(), 2);
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
