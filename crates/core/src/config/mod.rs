//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (QUARRY_*)
//! 2. TOML config file (if QUARRY_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// One logical source to index: a named corpus of documents reachable from a
/// sitemap and/or a static list of seed URLs.
///
/// Defined in the TOML file as `[[sources]]` tables. URLs are kept as strings
/// here and parsed at discovery time; `validate()` rejects unparseable ones
/// up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Unique source name; also the lease name serializing runs.
    pub name: String,

    /// Sitemap URL for candidate discovery.
    #[serde(default)]
    pub sitemap: Option<String>,

    /// Static fallback URLs, used when the sitemap is absent or unreachable.
    #[serde(default)]
    pub seeds: Vec<String>,
}

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (QUARRY_*)
/// 2. TOML config file (if QUARRY_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite store (records, bodies, leases, chunks).
    ///
    /// Set via QUARRY_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via QUARRY_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Maximum bytes to fetch per request.
    ///
    /// Set via QUARRY_MAX_BYTES environment variable.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via QUARRY_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum redirects to follow per request.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Whether to respect robots.txt rules.
    ///
    /// Set via QUARRY_RESPECT_ROBOTS environment variable.
    #[serde(default = "default_true")]
    pub respect_robots: bool,

    /// Whether to refuse fetching hosts that resolve to private or
    /// reserved addresses.
    #[serde(default = "default_true")]
    pub deny_private: bool,

    /// In-flight resources per batch during an indexing run.
    #[serde(default = "default_batch_width")]
    pub batch_width: usize,

    /// Pause between batches, in milliseconds.
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    /// Total embedding attempts per resource (first try included).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay before the first embedding retry; doubles each attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Lease time-to-live in seconds; sized to a full pass over a source.
    ///
    /// Set via QUARRY_LEASE_TTL_SECS environment variable.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Base URL of the embedding service.
    ///
    /// Set via QUARRY_EMBED_ENDPOINT environment variable.
    #[serde(default = "default_embed_endpoint")]
    pub embed_endpoint: String,

    /// Embedding model identifier.
    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Expected embedding vector width.
    #[serde(default = "default_embed_dimensions")]
    pub embed_dimensions: usize,

    /// Chunks per embedding request.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    /// Upper bound on chunk size, in characters.
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    /// Sources available to index, looked up by name.
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./quarry.sqlite")
}

fn default_user_agent() -> String {
    "quarry/0.1".into()
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_redirects() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_batch_width() -> usize {
    4
}

fn default_batch_pause_ms() -> u64 {
    1_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_lease_ttl_secs() -> u64 {
    1_800
}

fn default_embed_endpoint() -> String {
    "http://localhost:11434".into()
}

fn default_embed_model() -> String {
    "nomic-embed-text".into()
}

fn default_embed_dimensions() -> usize {
    768
}

fn default_embed_batch_size() -> usize {
    32
}

fn default_chunk_max_chars() -> usize {
    2_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_agent: default_user_agent(),
            max_bytes: default_max_bytes(),
            timeout_ms: default_timeout_ms(),
            max_redirects: default_max_redirects(),
            respect_robots: true,
            deny_private: true,
            batch_width: default_batch_width(),
            batch_pause_ms: default_batch_pause_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
            embed_endpoint: default_embed_endpoint(),
            embed_model: default_embed_model(),
            embed_dimensions: default_embed_dimensions(),
            embed_batch_size: default_embed_batch_size(),
            chunk_max_chars: default_chunk_max_chars(),
            sources: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Inter-batch pause as Duration.
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    /// Delay before the first embedding retry.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Lease time-to-live as Duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Look up a configured source by name.
    pub fn find_source(&self, name: &str) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `QUARRY_`
    /// 2. TOML file from `QUARRY_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("QUARRY_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("QUARRY_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
