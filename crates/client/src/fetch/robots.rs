//! robots.txt compliance with caching.
//!
//! Fetches and caches robots.txt files per-origin, respecting a 24-hour TTL.
//! Besides the allow/deny decision, cached files also surface their
//! `Sitemap:` directives so manifest discovery can use them.

use robotstxt_rs::RobotsTxt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use url::Url;

/// Default TTL for robots.txt cache (24 hours).
const ROBOTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum size of robots.txt to fetch (1MB).
const MAX_ROBOTS_SIZE: usize = 1024 * 1024;

/// Error type for robots.txt operations.
#[derive(Debug, thiserror::Error)]
pub enum RobotsError {
    #[error("robots.txt disallowed: {path} (robots_url: {robots_url})")]
    Disallowed { path: String, robots_url: String },

    #[error("failed to fetch robots.txt: {0}")]
    FetchError(String),

    #[error("robots.txt too large")]
    TooLarge,
}

/// Cached robots.txt entry with timestamp.
struct CachedRobots {
    robots: RobotsTxt,
    sitemaps: Vec<String>,
    fetched_at: Instant,
}

impl CachedRobots {
    fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() > ROBOTS_TTL
    }
}

/// Robots.txt URL for the origin of a URL, keeping scheme, host, and any
/// explicit port.
fn robots_url_for(url: &Url) -> String {
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    robots.to_string()
}

/// Extract `Sitemap:` directives from a robots.txt body. The directive is
/// host-wide, so it may appear outside any user-agent group.
fn parse_sitemap_directives(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                if value.is_empty() { None } else { Some(value.to_string()) }
            } else {
                None
            }
        })
        .collect()
}

/// In-memory cache for robots.txt files.
///
/// Uses a simple HashMap with tokio RwLock for concurrent access.
pub struct RobotsCache {
    cache: Arc<RwLock<HashMap<String, CachedRobots>>>,
    user_agent: String,
    http: reqwest::Client,
}

impl RobotsCache {
    /// Create a new robots.txt cache.
    pub fn new(user_agent: String) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            user_agent,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Check that a URL is allowed by its host's robots.txt.
    ///
    /// Fetches and caches robots.txt for the origin if not already cached.
    /// Returns `RobotsError::Disallowed` when fetching the URL would violate
    /// the policy, on both the cached and the freshly-fetched path.
    pub async fn ensure_allowed(&self, url: &Url) -> Result<(), RobotsError> {
        let robots_url = robots_url_for(url);
        self.refresh_if_stale(&robots_url).await?;

        let cache = self.cache.read().await;
        let allowed = match cache.get(&robots_url) {
            Some(cached) => cached.robots.can_fetch(&self.user_agent, url.as_str()),
            // refreshed above; a racing cleanup can still evict the entry
            None => true,
        };
        tracing::debug!("robots.txt check for {}: allowed={}", url.as_str(), allowed);

        if allowed {
            Ok(())
        } else {
            Err(RobotsError::Disallowed { path: url.path().to_string(), robots_url })
        }
    }

    /// Sitemap URLs declared in the robots.txt covering `url`'s origin.
    ///
    /// Returns an empty list when the file exists but declares none, or when
    /// the host has no robots.txt at all.
    pub async fn sitemaps_for(&self, url: &Url) -> Result<Vec<String>, RobotsError> {
        let robots_url = robots_url_for(url);
        self.refresh_if_stale(&robots_url).await?;

        let cache = self.cache.read().await;
        Ok(cache.get(&robots_url).map(|cached| cached.sitemaps.clone()).unwrap_or_default())
    }

    /// Fetch and insert the robots.txt entry unless a fresh one is cached.
    async fn refresh_if_stale(&self, robots_url: &str) -> Result<(), RobotsError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(robots_url)
                && !cached.is_expired()
            {
                tracing::debug!("robots.txt cache hit for {}", robots_url);
                return Ok(());
            }
        }

        let (robots, sitemaps) = self.fetch_robots(robots_url).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            robots_url.to_string(),
            CachedRobots { robots, sitemaps, fetched_at: Instant::now() },
        );
        Ok(())
    }

    /// Fetch robots.txt from the given URL.
    async fn fetch_robots(&self, url: &str) -> Result<(RobotsTxt, Vec<String>), RobotsError> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| RobotsError::FetchError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            if let Some(len) = response.content_length()
                && len as usize > MAX_ROBOTS_SIZE
            {
                return Err(RobotsError::TooLarge);
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| RobotsError::FetchError(e.to_string()))?;

            if bytes.len() > MAX_ROBOTS_SIZE {
                return Err(RobotsError::TooLarge);
            }

            let content = String::from_utf8_lossy(&bytes);
            Ok((RobotsTxt::parse(&content), parse_sitemap_directives(&content)))
        } else if status.is_client_error() {
            tracing::debug!("robots.txt not found for {}, allowing all", url);
            Ok((RobotsTxt::parse(""), Vec::new()))
        } else {
            Err(RobotsError::FetchError(format!("status {}", status)))
        }
    }

    /// Clear expired entries from the cache.
    pub async fn cleanup_expired(&self) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, cached| !cached.is_expired());
    }
}
