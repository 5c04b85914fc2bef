//! Key-value backends behind the vector cache
//!
//! Backends are synchronous; the cache facade calls them on the blocking
//! thread pool. Single-key get/set atomicity is the backend's job, the facade
//! adds no locking of its own.

use super::CacheError;
use ahash::{HashMap, HashMapExt};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Get/set/expire key-value store holding encoded cache entries
pub trait CacheBackend: Send + Sync {
    /// Fetch values for `keys`, aligned with the input; expired entries are `None`
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError>;

    /// Store values that expire after `ttl`
    fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CacheError>;

    /// Remove one key, returning whether it existed
    fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Drop every expired entry, returning how many were removed
    fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Number of live entries
    fn len(&self) -> Result<usize, CacheError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// In-process backend, mostly for single runs and tests
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Unavailable("memory backend lock poisoned".to_string())
}

impl CacheBackend for MemoryBackend {
    fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let now = Instant::now();

        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|(_, expires_at)| *expires_at > now)
                    .map(|(value, _)| value.clone())
            })
            .collect())
    }

    fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CacheError> {
        let mut map = self.entries.write().map_err(poisoned)?;
        let expires_at = Instant::now() + ttl;

        for (key, value) in entries {
            map.insert(key.clone(), (value.clone(), expires_at));
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut map = self.entries.write().map_err(poisoned)?;
        Ok(map.remove(key).is_some())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let mut map = self.entries.write().map_err(poisoned)?;
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - map.len())
    }

    fn len(&self) -> Result<usize, CacheError> {
        let map = self.entries.read().map_err(poisoned)?;
        let now = Instant::now();
        Ok(map.values().filter(|(_, expires_at)| *expires_at > now).count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
