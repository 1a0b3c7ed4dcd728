use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use courier_common::util::normalize_dir_path;
use courier_common::Result;

use super::cache::RemoteCache;

/// TTL of the write lock key.
pub const LOCK_TTL: Duration = Duration::from_secs(10);
/// How long a writer waits for someone else's lock before taking it anyway.
pub const WAIT_LOCK_BUDGET: Duration = Duration::from_secs(10);
pub const WAIT_LOCK_STEP: Duration = Duration::from_millis(500);

/// Contents of a directory key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryBlob {
    /// Bumped on every write that changes the file set
    pub version: u64,
    pub files: BTreeMap<String, Value>,
}

/// A directory of JSON files stored as one key of a [`RemoteCache`].
///
/// Writers serialize through a `<dir>.locked` key. Reads wait for a
/// pending write to finish and refresh the directory's TTL.
#[derive(Clone)]
pub struct RemoteDirectory {
    cache: Arc<dyn RemoteCache>,
    dir: String,
    lock_key: String,
    expired_time: Duration,
}

impl RemoteDirectory {
    pub fn new(cache: Arc<dyn RemoteCache>, dir: &str, expired_time: Duration) -> Self {
        let dir = normalize_dir_path(dir);
        let lock_key = format!("{}.locked", dir);
        Self {
            cache,
            dir,
            lock_key,
            expired_time,
        }
    }

    pub fn path(&self) -> &str {
        &self.dir
    }

    pub async fn read_dir(&self) -> Result<DirectoryBlob> {
        self.wait_lock(WAIT_LOCK_BUDGET).await?;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> Result<DirectoryBlob> {
        match self.cache.get(&self.dir, Some(self.expired_time)).await? {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(DirectoryBlob::default()),
        }
    }

    /// Stores `blob`, deleting the key when it holds no files.
    pub async fn write_dir(&self, blob: &DirectoryBlob) -> Result<()> {
        if blob.files.is_empty() {
            return self.cache.del(&self.dir).await;
        }
        let data = serde_json::to_string(blob)?;
        self.cache
            .set(&self.dir, &data, Some(self.expired_time))
            .await
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.read_dir().await?.files.contains_key(name))
    }

    pub async fn read_file(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.read_dir().await?.files.remove(name))
    }

    /// Writes one file. The version only moves when the content changed.
    pub async fn write_file(&self, name: &str, content: Value) -> Result<()> {
        self.acquire_lock().await?;
        let result = async {
            let mut blob = self.read_unlocked().await?;
            if blob.files.get(name) != Some(&content) {
                blob.version += 1;
            }
            blob.files.insert(name.to_string(), content);
            self.write_dir(&blob).await
        }
        .await;
        self.unlock().await?;
        result
    }

    /// Removes files, dropping the whole directory once it is empty.
    pub async fn remove_files(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.acquire_lock().await?;
        let result = async {
            let mut blob = self.read_unlocked().await?;
            let before = blob.files.len();
            for name in names {
                blob.files.remove(name);
            }
            if blob.files.len() != before {
                blob.version += 1;
                self.write_dir(&blob).await?;
            }
            if blob.files.is_empty() {
                self.remove_dir().await?;
            }
            Ok(())
        }
        .await;
        self.unlock().await?;
        result
    }

    pub async fn lock(&self) -> Result<()> {
        self.cache.set(&self.lock_key, "1", Some(LOCK_TTL)).await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.cache.del(&self.lock_key).await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.cache.get(&self.lock_key, None).await?.is_some())
    }

    /// Polls the lock every `WAIT_LOCK_STEP` until it is free or `budget`
    /// runs out. Returns whether the lock was observed free.
    pub async fn wait_lock(&self, budget: Duration) -> Result<bool> {
        let mut remaining = budget;
        loop {
            if !self.is_locked().await? {
                return Ok(true);
            }
            if remaining < WAIT_LOCK_STEP {
                return Ok(false);
            }
            remaining -= WAIT_LOCK_STEP;
            tokio::time::sleep(WAIT_LOCK_STEP).await;
        }
    }

    /// Takes the write lock, overriding a holder that outlived the budget.
    async fn acquire_lock(&self) -> Result<()> {
        let mut remaining = WAIT_LOCK_BUDGET;
        loop {
            if self.cache.set_nx(&self.lock_key, "1", Some(LOCK_TTL)).await? {
                return Ok(());
            }
            if remaining < WAIT_LOCK_STEP {
                warn!(dir = %self.dir, "remote directory lock held too long, taking it over");
                return self.lock().await;
            }
            remaining -= WAIT_LOCK_STEP;
            tokio::time::sleep(WAIT_LOCK_STEP).await;
        }
    }

    pub async fn remove_dir(&self) -> Result<()> {
        self.cache.del(&self.dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_cache::MemoryCache;
    use serde_json::json;

    fn directory(cache: &MemoryCache) -> RemoteDirectory {
        RemoteDirectory::new(Arc::new(cache.clone()), "servers/", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_version_moves_only_on_change() {
        let cache = MemoryCache::new();
        let dir = directory(&cache);
        assert_eq!(dir.path(), "/servers");
        assert_eq!(dir.read_dir().await.unwrap(), DirectoryBlob::default());

        dir.write_file("a", json!({"port": 1})).await.unwrap();
        dir.write_file("a", json!({"port": 1})).await.unwrap();
        assert_eq!(dir.read_dir().await.unwrap().version, 1);

        dir.write_file("a", json!({"port": 2})).await.unwrap();
        dir.write_file("b", json!({"port": 3})).await.unwrap();
        let blob = dir.read_dir().await.unwrap();
        assert_eq!(blob.version, 3);
        assert_eq!(blob.files.len(), 2);
        assert!(!dir.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_last_file_drops_directory() {
        let cache = MemoryCache::new();
        let dir = directory(&cache);
        dir.write_file("a", json!(1)).await.unwrap();
        dir.remove_files(&["missing".to_string()]).await.unwrap();
        assert_eq!(dir.read_dir().await.unwrap().version, 1);

        dir.remove_files(&["a".to_string()]).await.unwrap();
        assert!(!cache.exists("/servers").await.unwrap());
        assert_eq!(dir.read_file("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_waits_for_writer_lock() {
        let cache = MemoryCache::new();
        let dir = directory(&cache);
        dir.write_file("a", json!(1)).await.unwrap();
        dir.lock().await.unwrap();

        let start = tokio::time::Instant::now();
        let unlocker = {
            let dir = dir.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1200)).await;
                dir.unlock().await.unwrap();
            })
        };
        assert!(dir.exists("a").await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        unlocker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_lock_gives_up_after_budget() {
        let cache = MemoryCache::new();
        let dir = directory(&cache);
        dir.lock().await.unwrap();
        let start = tokio::time::Instant::now();
        assert!(!dir.wait_lock(Duration::from_secs(2)).await.unwrap());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lock_is_taken_over() {
        let cache = MemoryCache::new();
        let dir = directory(&cache);
        // a lock without TTL never expires on its own
        cache.set("/servers.locked", "1", None).await.unwrap();
        dir.write_file("a", json!(1)).await.unwrap();
        assert_eq!(dir.read_dir().await.unwrap().files.len(), 1);
    }
}
