//! Vector cache
//!
//! Get/set facade over an external key-value store of embedding vectors.
//! Lookups and writes never fail the caller: a backend outage turns every
//! lookup into a miss and every write into a no-op, each with a warning.

mod backend;
mod codec;
pub mod key;
mod sqlite;

pub use backend::{CacheBackend, MemoryBackend};
pub use codec::{decode, encode, CacheEntry, Encoded};
pub use key::{derive_identity, storage_key};
pub use sqlite::SqliteBackend;

use crate::config::{expand_tilde, CacheConfig};
use crate::document::Document;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Cache entry encoding failed: {0}")]
    Codec(String),

    #[error("Corrupted cache entry: {0}")]
    Corrupted(String),
}

/// Cache settings derived from configuration
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Key namespace shared by every entry
    pub namespace: String,
    /// Key format version; bumping it invalidates old entries
    pub schema_version: u32,
    /// Entry time-to-live
    pub ttl: Duration,
    /// Encoded entries at least this large are compressed
    pub compression_threshold: usize,
    /// Active model tag; entries written under another tag are misses
    pub model_tag: String,
    /// Active vector dimensionality
    pub dimension: usize,
}

/// Result of a bulk lookup, as indices into the looked-up slice
#[derive(Debug, Default)]
pub struct CacheLookup {
    pub hits: Vec<(usize, Vec<f32>)>,
    pub misses: Vec<usize>,
    /// True when the backend could not be reached
    pub degraded: bool,
}

/// Running counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Open the backend named by the cache configuration
pub fn open_backend(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, CacheError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryBackend::new())),
        "sqlite" => {
            let path = expand_tilde(&config.path);
            tracing::info!("Opening vector cache at {:?}", path);
            Ok(Arc::new(SqliteBackend::open(&path)?))
        }
        other => Err(CacheError::Unavailable(format!(
            "Unknown cache backend: {}",
            other
        ))),
    }
}

/// Facade over a [`CacheBackend`]
pub struct VectorCache {
    backend: Option<Arc<dyn CacheBackend>>,
    settings: CacheSettings,
    stats: CacheStats,
}

impl VectorCache {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: CacheSettings) -> Self {
        Self {
            backend: Some(backend),
            settings,
            stats: CacheStats::default(),
        }
    }

    /// A cache that never stores anything; every lookup is a miss
    pub fn disabled(settings: CacheSettings) -> Self {
        Self {
            backend: None,
            settings,
            stats: CacheStats::default(),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Name of the backing store, `"disabled"` when there is none
    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.name()).unwrap_or("disabled")
    }

    fn key_for(&self, doc: &Document) -> Option<(String, String)> {
        key::derive_identity(doc).map(|identity| {
            let key = key::storage_key(
                &self.settings.namespace,
                self.settings.schema_version,
                &identity,
            );
            (identity, key)
        })
    }

    /// Look up vectors for `documents`
    ///
    /// Documents without a derivable identity are always misses.
    pub async fn get_many(&self, documents: &[Document]) -> CacheLookup {
        let mut lookup = CacheLookup::default();

        let Some(backend) = self.backend.clone() else {
            lookup.misses = (0..documents.len()).collect();
            return lookup;
        };

        let mut identities = Vec::new();
        let mut keys = Vec::new();
        let mut positions = Vec::new();

        for (idx, doc) in documents.iter().enumerate() {
            match self.key_for(doc) {
                Some((identity, key)) => {
                    identities.push(identity);
                    keys.push(key);
                    positions.push(idx);
                }
                None => lookup.misses.push(idx),
            }
        }

        if keys.is_empty() {
            self.stats
                .misses
                .fetch_add(lookup.misses.len() as u64, Ordering::Relaxed);
            return lookup;
        }

        let fetched = tokio::task::spawn_blocking(move || backend.get_many(&keys))
            .await
            .map_err(|e| CacheError::Unavailable(format!("lookup task failed: {}", e)))
            .and_then(|r| r);

        let values = match fetched {
            Ok(values) => values,
            Err(e) => {
                warn!("Vector cache lookup failed, continuing uncached: {}", e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .misses
                    .fetch_add(documents.len() as u64, Ordering::Relaxed);
                return CacheLookup {
                    hits: Vec::new(),
                    misses: (0..documents.len()).collect(),
                    degraded: true,
                };
            }
        };

        for ((idx, identity), value) in positions.into_iter().zip(identities).zip(values) {
            match value.and_then(|bytes| self.accept(&identity, &bytes)) {
                Some(vector) => lookup.hits.push((idx, vector)),
                None => lookup.misses.push(idx),
            }
        }

        lookup.misses.sort_unstable();
        self.stats
            .hits
            .fetch_add(lookup.hits.len() as u64, Ordering::Relaxed);
        self.stats
            .misses
            .fetch_add(lookup.misses.len() as u64, Ordering::Relaxed);

        lookup
    }

    /// Decode and validate a stored entry against the requesting identity
    fn accept(&self, identity: &str, bytes: &[u8]) -> Option<Vec<f32>> {
        let entry = match decode(bytes) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Treating unreadable cache entry for {} as a miss: {}", identity, e);
                return None;
            }
        };

        if entry.model != self.settings.model_tag {
            debug!(
                "Cache entry for {} was written by {}, active model is {}",
                identity, entry.model, self.settings.model_tag
            );
            return None;
        }

        if entry.identity != identity {
            warn!(
                "Cache key collision: slot for {} holds {}, ignoring",
                identity, entry.identity
            );
            return None;
        }

        if entry.vector.len() != self.settings.dimension {
            debug!(
                "Cache entry for {} has dimension {}, expected {}",
                identity,
                entry.vector.len(),
                self.settings.dimension
            );
            return None;
        }

        Some(entry.vector)
    }

    /// Store vectors for documents; uncacheable documents are skipped
    pub async fn set_many(&self, items: &[(&Document, &[f32])]) {
        let Some(backend) = self.backend.clone() else {
            return;
        };

        let created_at = chrono::Utc::now().timestamp();
        let mut entries = Vec::with_capacity(items.len());

        for (doc, vector) in items {
            let Some((identity, key)) = self.key_for(doc) else {
                continue;
            };

            let entry = CacheEntry {
                identity,
                vector: vector.to_vec(),
                created_at,
                model: self.settings.model_tag.clone(),
            };

            match encode(&entry, self.settings.compression_threshold) {
                Ok(encoded) => entries.push((key, encoded.bytes)),
                Err(e) => warn!("Skipping cache write for {}: {}", entry.identity, e),
            }
        }

        if entries.is_empty() {
            return;
        }

        let count = entries.len() as u64;
        let ttl = self.settings.ttl;
        let stored = tokio::task::spawn_blocking(move || backend.set_many(&entries, ttl))
            .await
            .map_err(|e| CacheError::Unavailable(format!("write task failed: {}", e)))
            .and_then(|r| r);

        match stored {
            Ok(()) => {
                self.stats.writes.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Vector cache write failed, continuing uncached: {}", e);
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop the cached vector of one document
    pub async fn invalidate(&self, doc: &Document) -> Result<bool, CacheError> {
        let (Some(backend), Some((_, key))) = (self.backend.clone(), self.key_for(doc)) else {
            return Ok(false);
        };

        tokio::task::spawn_blocking(move || backend.delete(&key))
            .await
            .map_err(|e| CacheError::Unavailable(format!("invalidate task failed: {}", e)))?
    }

    /// Remove expired entries from the backing store
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        let Some(backend) = self.backend.clone() else {
            return Ok(0);
        };

        tokio::task::spawn_blocking(move || backend.purge_expired())
            .await
            .map_err(|e| CacheError::Unavailable(format!("purge task failed: {}", e)))?
    }

    /// Number of live entries in the backing store
    pub async fn len(&self) -> Result<usize, CacheError> {
        let Some(backend) = self.backend.clone() else {
            return Ok(0);
        };

        tokio::task::spawn_blocking(move || backend.len())
            .await
            .map_err(|e| CacheError::Unavailable(format!("count task failed: {}", e)))?
    }
}
