//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;
use url::Url;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `max_bytes` is 0 or exceeds 50MB
    /// - `timeout_ms` is less than 100ms or exceeds 5 minutes
    /// - `user_agent` is empty
    /// - pipeline tunables fall outside their supported ranges
    /// - a source has no discoverable URLs or an unparseable one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == 0 {
            return Err(ConfigError::Invalid { field: "max_bytes".into(), reason: "must be greater than 0".into() });
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(ConfigError::Invalid { field: "max_bytes".into(), reason: "must not exceed 50MB".into() });
        }

        if self.timeout_ms < 100 {
            return Err(ConfigError::Invalid { field: "timeout_ms".into(), reason: "must be at least 100ms".into() });
        }
        if self.timeout_ms > 300_000 {
            return Err(ConfigError::Invalid {
                field: "timeout_ms".into(),
                reason: "must not exceed 5 minutes (300000ms)".into(),
            });
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.batch_width == 0 || self.batch_width > 16 {
            return Err(ConfigError::Invalid { field: "batch_width".into(), reason: "must be between 1 and 16".into() });
        }
        if self.batch_pause_ms > 60_000 {
            return Err(ConfigError::Invalid {
                field: "batch_pause_ms".into(),
                reason: "must not exceed 60 seconds".into(),
            });
        }

        if self.retry_attempts == 0 || self.retry_attempts > 10 {
            return Err(ConfigError::Invalid {
                field: "retry_attempts".into(),
                reason: "must be between 1 and 10".into(),
            });
        }

        if self.lease_ttl_secs < 60 {
            return Err(ConfigError::Invalid {
                field: "lease_ttl_secs".into(),
                reason: "must be at least 60 seconds".into(),
            });
        }

        if self.embed_dimensions == 0 {
            return Err(ConfigError::Invalid {
                field: "embed_dimensions".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.embed_batch_size == 0 || self.embed_batch_size > 512 {
            return Err(ConfigError::Invalid {
                field: "embed_batch_size".into(),
                reason: "must be between 1 and 512".into(),
            });
        }
        if Url::parse(&self.embed_endpoint).is_err() {
            return Err(ConfigError::Invalid {
                field: "embed_endpoint".into(),
                reason: "must be a valid URL".into(),
            });
        }

        if self.chunk_max_chars < 100 || self.chunk_max_chars > 20_000 {
            return Err(ConfigError::Invalid {
                field: "chunk_max_chars".into(),
                reason: "must be between 100 and 20000".into(),
            });
        }

        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ConfigError::Invalid { field: "sources".into(), reason: "source name is empty".into() });
            }
            if source.sitemap.is_none() && source.seeds.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "sources".into(),
                    reason: format!("source '{}' has neither a sitemap nor seeds", source.name),
                });
            }
            for raw in source.sitemap.iter().chain(source.seeds.iter()) {
                if Url::parse(raw).is_err() {
                    return Err(ConfigError::Invalid {
                        field: "sources".into(),
                        reason: format!("source '{}' has invalid URL: {raw}", source.name),
                    });
                }
            }
        }

        Ok(())
    }
}
