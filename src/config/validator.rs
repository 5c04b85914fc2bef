use crate::config::{parse_duration, Config};
use crate::error::{Result, TierankError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_pool(config, &mut errors);
        Self::validate_ranking(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TierankError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let mode = &config.embedding.mode;
        if mode != "model" && mode != "hash" {
            errors.push(ValidationError::new(
                "embedding.mode",
                format!("Mode must be 'model' or 'hash', got '{}'", mode),
            ));
        }

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Dimension must be greater than 0",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        let backend = &config.cache.backend;
        if backend != "memory" && backend != "sqlite" {
            errors.push(ValidationError::new(
                "cache.backend",
                format!("Backend must be 'memory' or 'sqlite', got '{}'", backend),
            ));
        }

        if backend == "sqlite" && config.cache.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "cache.path",
                "SQLite cache path cannot be empty",
            ));
        }

        if config.cache.namespace.is_empty() {
            errors.push(ValidationError::new(
                "cache.namespace",
                "Namespace cannot be empty",
            ));
        }

        Self::check_duration("cache.ttl", &config.cache.ttl, errors);
    }

    fn validate_pool(config: &Config, errors: &mut Vec<ValidationError>) {
        let pool = &config.pool;

        if pool.workers == 0 {
            errors.push(ValidationError::new(
                "pool.workers",
                "Worker count must be greater than 0",
            ));
        }

        if pool.min_batch_size == 0 {
            errors.push(ValidationError::new(
                "pool.min_batch_size",
                "Minimum batch size must be greater than 0",
            ));
        }

        if pool.max_batch_size < pool.min_batch_size {
            errors.push(ValidationError::new(
                "pool.max_batch_size",
                format!(
                    "Maximum batch size ({}) is below minimum ({})",
                    pool.max_batch_size, pool.min_batch_size
                ),
            ));
        }

        if pool.queue_depth == 0 {
            errors.push(ValidationError::new(
                "pool.queue_depth",
                "Queue depth must be greater than 0",
            ));
        }

        if pool.max_in_flight == 0 {
            errors.push(ValidationError::new(
                "pool.max_in_flight",
                "In-flight limit must be greater than 0",
            ));
        }

        if pool.max_retries > 10 {
            errors.push(ValidationError::new(
                "pool.max_retries",
                format!("At most 10 retries are allowed, got {}", pool.max_retries),
            ));
        }

        Self::check_duration("pool.retry_backoff", &pool.retry_backoff, errors);
        Self::check_duration("pool.submit_timeout", &pool.submit_timeout, errors);
        Self::check_duration("pool.ready_timeout", &pool.ready_timeout, errors);
        Self::check_duration("pool.health_interval", &pool.health_interval, errors);
    }

    fn validate_ranking(config: &Config, errors: &mut Vec<ValidationError>) {
        let tiers = &config.ranking.tiers;

        if tiers.is_empty() {
            errors.push(ValidationError::new(
                "ranking.tiers",
                "At least one tier is required",
            ));
            return;
        }

        let mut sorted: Vec<_> = tiers.iter().collect();
        sorted.sort_by_key(|t| t.priority);

        for pair in sorted.windows(2) {
            if pair[0].priority == pair[1].priority {
                errors.push(ValidationError::new(
                    "ranking.tiers",
                    format!("Duplicate tier priority {}", pair[0].priority),
                ));
            }
            if pair[1].boundary <= pair[0].boundary {
                errors.push(ValidationError::new(
                    "ranking.tiers",
                    format!(
                        "Tier '{}' boundary {} must exceed '{}' boundary {}",
                        pair[1].name, pair[1].boundary, pair[0].name, pair[0].boundary
                    ),
                ));
            }
        }

        if sorted[0].boundary == 0 {
            errors.push(ValidationError::new(
                "ranking.tiers",
                "First tier boundary must be greater than 0",
            ));
        }
    }

    fn check_duration(path: &str, value: &str, errors: &mut Vec<ValidationError>) {
        if parse_duration(value).is_none() {
            errors.push(ValidationError::new(
                path,
                format!("Invalid duration format: {}", value),
            ));
        }
    }
}
