//! Durable cache level.
//!
//! A [`DurableStore`] persists [`CacheEntry`] values across restarts. The
//! bundled [`FileStore`] keeps one JSON document per `(fingerprint, tier)`:
//!
//! ```text
//! <dir>/<digest>.<tier>.json
//! ```
//!
//! Writes go to a uniquely named temp file first and are renamed into place,
//! so a crash mid-write never leaves a half-written entry under the real name.
//! Unreadable documents are deleted and reported as a miss.

use super::{CacheEntry, CacheKey};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from a durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Entry could not be encoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Backend-specific failure (e.g. Redis).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Persistent key/value level behind the in-memory cache.
///
/// Implementations must be safe to call concurrently for different keys.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short backend label used in snapshots and logs.
    fn name(&self) -> &'static str;

    /// Load the entry for `key`. Missing or unreadable entries are `Ok(None)`.
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Persist `entry`, replacing any previous value for its key.
    async fn save(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Delete the entry for `key`. Deleting a missing entry is not an error.
    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Delete every entry.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// One JSON file per entry in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the store directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        debug!(dir = %dir.display(), "file store opened");
        Ok(Self { dir })
    }

    /// The store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document holding `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{}.json", key.digest, key.tier))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl DurableStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.path_for(key);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };

        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.key() == *key => Ok(Some(entry)),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "discarding unreadable cache entry");
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let path = self.path_for(&entry.key());
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(entry)?;

        tokio::fs::write(&tmp, &body).await.map_err(io_err(&tmp))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&path)(e));
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;
        let mut removed = 0usize;
        while let Some(item) = dir.next_entry().await.map_err(io_err(&self.dir))? {
            let path = item.path();
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") || name.ends_with(".tmp") {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path)(e)),
                }
            }
        }
        debug!(dir = %self.dir.display(), removed, "file store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fingerprint, Outcome, TierId};

    fn entry(q: &str, tier: TierId) -> CacheEntry {
        CacheEntry::new(&fingerprint(q), tier, Outcome::solved("4", "test"), None)
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = FileStore::open(dir.path()).await.expect("test: open");
        let e = entry("2+2", TierId::Symbolic);

        store.save(&e).await.expect("test: save");
        assert!(store.path_for(&e.key()).exists());
        assert_eq!(store.load(&e.key()).await.expect("test: load"), Some(e.clone()));

        store.remove(&e.key()).await.expect("test: remove");
        assert_eq!(store.load(&e.key()).await.expect("test: load"), None);
        store.remove(&e.key()).await.expect("test: removing twice is fine");
    }

    #[tokio::test]
    async fn test_corrupt_document_is_a_miss_and_deleted() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = FileStore::open(dir.path()).await.expect("test: open");
        let key = entry("2+2", TierId::Symbolic).key();
        std::fs::write(store.path_for(&key), b"{ not json").expect("test: write");

        assert_eq!(store.load(&key).await.expect("test: load"), None);
        assert!(!store.path_for(&key).exists());
    }

    #[tokio::test]
    async fn test_clear_removes_only_cache_documents() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = FileStore::open(dir.path()).await.expect("test: open");
        store.save(&entry("a", TierId::Symbolic)).await.expect("test: save");
        store.save(&entry("b", TierId::Reasoning)).await.expect("test: save");
        std::fs::write(dir.path().join("README"), b"keep").expect("test: write");

        store.clear().await.expect("test: clear");

        let left: Vec<_> = std::fs::read_dir(dir.path())
            .expect("test: read_dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(left, vec!["README".to_string()]);
    }

    #[tokio::test]
    async fn test_tiers_of_same_fingerprint_are_separate_files() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let store = FileStore::open(dir.path()).await.expect("test: open");
        let a = entry("q", TierId::Symbolic);
        let b = entry("q", TierId::Computational);
        assert_ne!(store.path_for(&a.key()), store.path_for(&b.key()));
    }
}
