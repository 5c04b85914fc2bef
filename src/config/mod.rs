//! Configuration management for tierank
//!
//! Loads the TOML configuration, applies profile and environment overrides,
//! validates it, and converts sections into the typed settings each
//! component is constructed from.

use crate::cache::CacheSettings;
use crate::error::{Result, TierankError};
use crate::pool::PoolSettings;
use crate::ranking::{TierDescriptor, TierName, TierPlan};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub ranking: RankingConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub mode: String, // "model" or "hash"
    pub dimension: usize,
}

/// Vector cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub backend: String, // "memory" or "sqlite"
    pub path: PathBuf,
    pub namespace: String,
    pub schema_version: u32,
    pub ttl: String,
    pub compression_threshold: usize,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub enabled: bool,
    pub workers: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub queue_depth: usize,
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub retry_backoff: String,
    pub submit_timeout: String,
    pub ready_timeout: String,
    pub health_interval: String,
}

/// Tier layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingConfig {
    pub tiers: Vec<TierConfig>,
}

/// One tier descriptor as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: TierName,
    pub boundary: usize,
    pub priority: u8,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from a file, with env overrides applied
    pub fn load(path: &Path) -> Result<Self> {
        Self::read(path)?.resolve(None, std::env::vars())
    }

    /// Load configuration with a specific profile applied
    ///
    /// The profile goes first so explicit `TIERANK_*` variables still win.
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        Self::read(path)?.resolve(Some(profile), std::env::vars())
    }

    /// Apply the profile, then env overrides, then validate
    pub fn resolve<I>(mut self, profile: Option<&str>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if let Some(profile) = profile {
            self.apply_profile(profile)?;
        }
        self.apply_overrides_from(vars);
        ConfigValidator::validate(&self)?;
        Ok(self)
    }

    fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TierankError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| TierankError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TierankError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| TierankError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| TierankError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(mode) = overrides.embedding_mode {
            self.embedding.mode = mode;
        }
        if let Some(model) = overrides.embedding_model {
            self.embedding.model = model;
        }
        if let Some(backend) = overrides.cache_backend {
            self.cache.backend = backend;
        }
        if let Some(workers) = overrides.pool_workers {
            self.pool.workers = workers;
        }
        if let Some(enabled) = overrides.pool_enabled {
            self.pool.enabled = enabled;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: TIERANK_SECTION__KEY=value
    fn apply_overrides_from<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("TIERANK_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "EMBEDDING__MODE" => self.embedding.mode = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "CACHE__BACKEND" => self.cache.backend = value.to_string(),
            "CACHE__PATH" => self.cache.path = PathBuf::from(value),
            "CACHE__TTL" => self.cache.ttl = value.to_string(),
            "CACHE__ENABLED" => self.cache.enabled = parse_env(path, value)?,
            "POOL__ENABLED" => self.pool.enabled = parse_env(path, value)?,
            "POOL__WORKERS" => self.pool.workers = parse_env(path, value)?,
            "POOL__MAX_RETRIES" => self.pool.max_retries = parse_env(path, value)?,
            "POOL__SUBMIT_TIMEOUT" => self.pool.submit_timeout = value.to_string(),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Vector cache settings for this configuration
    pub fn cache_settings(&self, model_tag: String) -> Result<CacheSettings> {
        Ok(CacheSettings {
            namespace: self.cache.namespace.clone(),
            schema_version: self.cache.schema_version,
            ttl: duration_at("cache.ttl", &self.cache.ttl)?,
            compression_threshold: self.cache.compression_threshold,
            model_tag,
            dimension: self.embedding.dimension,
        })
    }

    /// Worker pool settings for this configuration
    pub fn pool_settings(&self) -> Result<PoolSettings> {
        Ok(PoolSettings {
            workers: self.pool.workers,
            min_batch_size: self.pool.min_batch_size,
            max_batch_size: self.pool.max_batch_size,
            queue_depth: self.pool.queue_depth,
            max_in_flight: self.pool.max_in_flight,
            max_retries: self.pool.max_retries,
            retry_backoff: duration_at("pool.retry_backoff", &self.pool.retry_backoff)?,
            health_interval: duration_at("pool.health_interval", &self.pool.health_interval)?,
        })
    }

    /// Per-submission worker timeout
    pub fn submit_timeout(&self) -> Result<Duration> {
        duration_at("pool.submit_timeout", &self.pool.submit_timeout)
    }

    /// Readiness barrier timeout used at pool start
    pub fn ready_timeout(&self) -> Result<Duration> {
        duration_at("pool.ready_timeout", &self.pool.ready_timeout)
    }

    /// Tier plan for this configuration
    pub fn tier_plan(&self) -> Result<TierPlan> {
        let descriptors = self
            .ranking
            .tiers
            .iter()
            .map(|t| TierDescriptor::new(t.name, t.boundary, t.priority))
            .collect();

        TierPlan::new(descriptors).map_err(|e| TierankError::InvalidConfigValue {
            path: "ranking.tiers".to_string(),
            message: e.to_string(),
        })
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| TierankError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("tierank").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| TierankError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".tierank"))
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = Self::default_data_dir().unwrap_or_else(|_| PathBuf::from("~/.tierank"));

        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                mode: "model".to_string(),
                dimension: 384,
            },
            cache: CacheConfig {
                enabled: true,
                backend: "sqlite".to_string(),
                path: data_dir.join("vector_cache.sqlite"),
                namespace: "tierank:vec".to_string(),
                schema_version: 1,
                ttl: "7d".to_string(),
                compression_threshold: 1024,
            },
            pool: PoolConfig {
                enabled: true,
                workers: 4,
                min_batch_size: 8,
                max_batch_size: 64,
                queue_depth: 4,
                max_in_flight: 16,
                max_retries: 3,
                retry_backoff: "100ms".to_string(),
                submit_timeout: "30s".to_string(),
                ready_timeout: "120s".to_string(),
                health_interval: "10s".to_string(),
            },
            ranking: RankingConfig {
                tiers: vec![
                    TierConfig {
                        name: TierName::Immediate,
                        boundary: 50,
                        priority: 1,
                    },
                    TierConfig {
                        name: TierName::Refined,
                        boundary: 200,
                        priority: 2,
                    },
                    TierConfig {
                        name: TierName::Complete,
                        boundary: 600,
                        priority: 3,
                    },
                ],
            },
            profiles: default_profiles(),
        }
    }
}

fn default_profiles() -> HashMap<String, ProfileOverrides> {
    let mut profiles = HashMap::new();
    profiles.insert(
        "offline".to_string(),
        ProfileOverrides {
            embedding_mode: Some("hash".to_string()),
            cache_backend: Some("memory".to_string()),
            ..Default::default()
        },
    );
    profiles.insert(
        "single-threaded".to_string(),
        ProfileOverrides {
            pool_enabled: Some(false),
            ..Default::default()
        },
    );
    profiles
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| TierankError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

fn duration_at(path: &str, value: &str) -> Result<Duration> {
    parse_duration(value).ok_or_else(|| TierankError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Invalid duration: {}", value),
    })
}

/// Parse duration strings such as "250ms", "30s", "5m", "2h", "7d"
///
/// A bare number is read as seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();

    // Check "ms" before "s" because "ms" ends with "s"
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }

    let (number, multiplier) = if let Some(n) = value.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = value.strip_suffix('d') {
        (n, 86_400)
    } else {
        (value, 1)
    };

    number
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .map(Duration::from_secs)
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
