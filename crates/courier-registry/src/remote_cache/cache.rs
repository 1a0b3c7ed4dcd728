use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use courier_common::{Result, RpcError};

/// Key-value store shared by every process of a cluster, Redis style.
///
/// Values are strings. `ttl` arguments set (or, for `get`, refresh) the
/// key's expiry; `None` leaves it untouched.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Sets `key` only when absent. Returns whether it was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn scard(&self, key: &str) -> Result<usize>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hlen(&self, key: &str) -> Result<usize>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn decr(&self, key: &str) -> Result<i64>;
}

enum Stored {
    Str(String),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

/// In-process [`RemoteCache`]. Clones share storage; expired keys are
/// dropped lazily on access.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

fn wrong_type(key: &str) -> RpcError {
    RpcError::Registry(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Locks the store after evicting `key` if it expired.
    fn live(&self, key: &str) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.lock();
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        entries
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.live(key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Str("0".to_string()),
            expires_at: None,
        });
        let Stored::Str(current) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let n: i64 = current
            .parse()
            .map_err(|_| RpcError::Registry(format!("value of {} is not an integer", key)))?;
        let n = n + delta;
        *current = n.to_string();
        Ok(n)
    }
}

#[async_trait]
impl RemoteCache for MemoryCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).contains_key(key))
    }

    async fn get(&self, key: &str, ttl: Option<Duration>) -> Result<Option<String>> {
        let mut entries = self.live(key);
        match entries.get_mut(key) {
            None => Ok(None),
            Some(entry) => {
                if let Some(ttl) = ttl {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
                match &entry.value {
                    Stored::Str(s) => Ok(Some(s.clone())),
                    _ => Err(wrong_type(key)),
                }
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.lock().insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut entries = self.live(key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.live(key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Set(HashSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Set(set) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.live(key).get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Stored::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.live(key);
        let empty = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Stored::Set(set)) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        match self.live(key).get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Stored::Set(set)) => Ok(set.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.live(key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Stored::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.live(key).get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Stored::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut entries = self.live(key);
        let empty = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Stored::Hash(hash)) => {
                hash.remove(field);
                hash.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        match self.live(key).get(key).map(|e| &e.value) {
            None => Ok(0),
            Some(Stored::Hash(hash)) => Ok(hash.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.add_to_counter(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.add_to_counter(key, -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_refresh() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Some(Duration::from_secs(10))).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        // refreshing pushes the expiry 10s out from now
        assert_eq!(cache.get("k", Some(Duration::from_secs(10))).await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!cache.exists("k").await.unwrap());
        assert_eq!(cache.get("k", None).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx() {
        let cache = MemoryCache::new();
        assert!(cache.set_nx("lock", "1", Some(Duration::from_secs(1))).await.unwrap());
        assert!(!cache.set_nx("lock", "1", Some(Duration::from_secs(1))).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.set_nx("lock", "1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_sets_and_hashes() {
        let cache = MemoryCache::new();
        cache.sadd("s", "a").await.unwrap();
        cache.sadd("s", "b").await.unwrap();
        cache.sadd("s", "a").await.unwrap();
        assert_eq!(cache.scard("s").await.unwrap(), 2);
        cache.srem("s", "a").await.unwrap();
        cache.srem("s", "b").await.unwrap();
        assert!(!cache.exists("s").await.unwrap());

        cache.hset("h", "f", "1").await.unwrap();
        assert_eq!(cache.hget("h", "f").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.hlen("h").await.unwrap(), 1);
        cache.hdel("h", "f").await.unwrap();
        assert_eq!(cache.hlen("h").await.unwrap(), 0);

        assert!(matches!(cache.get("s2", None).await, Ok(None)));
        cache.sadd("s2", "x").await.unwrap();
        assert!(cache.get("s2", None).await.is_err());
    }

    #[tokio::test]
    async fn test_counters() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("n").await.unwrap(), 1);
        assert_eq!(cache.incr("n").await.unwrap(), 2);
        assert_eq!(cache.decr("n").await.unwrap(), 1);
        assert_eq!(cache.decr("m").await.unwrap(), -1);
    }
}
