//! HTTP fetch pipeline with SSRF protection, robots.txt compliance, and
//! conditional requests.
//!
//! ### URL Canonicalization
//! - Trim whitespace, ensure scheme (default: `https`)
//! - Lowercase host, remove fragments
//! - Preserve query string
//!
//! ### SSRF & Safety Gates
//! - Deny private ranges (RFC1918, link-local, localhost, etc.)
//! - Resolve DNS and validate all A/AAAA answers are public.
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)
//!
//! ### robots.txt Compliance
//! - Fetch and cache `robots.txt` per origin (24h cache).
//! - Evaluate `*` and current User-Agent.
//!
//! ### Conditional Requests
//! - `probe` issues a HEAD request and reports the resource's current
//!   validators without transferring the body.
//! - `fetch` optionally sends `If-None-Match` / `If-Modified-Since` and
//!   reports `304 Not Modified` as [`FetchOutcome::NotModified`].

pub mod robots;
pub mod ssrf;
pub mod url;

use async_trait::async_trait;
use bytes::Bytes;
use ::url::Host;
use reqwest::Url;
use reqwest::{Client, StatusCode, header};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub use robots::{RobotsCache, RobotsError};
pub use ssrf::{SsrfError, validate_addrs, validate_ip};
pub use url::{UrlError, canonical_key, canonicalize};

use quarry_core::Error;

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "quarry/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 5MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,

    /// Whether to respect robots.txt (default: true)
    pub respect_robots: bool,

    /// Whether to refuse requests resolving to private/reserved addresses
    /// (default: true)
    pub deny_private: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "quarry/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
            respect_robots: true,
            deny_private: true,
        }
    }
}

impl From<&quarry_core::AppConfig> for FetchConfig {
    fn from(config: &quarry_core::AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            max_redirects: config.max_redirects,
            respect_robots: config.respect_robots,
            deny_private: config.deny_private,
        }
    }
}

/// HTTP cache validators for a resource, as last reported by its server.
///
/// Raw header values are kept verbatim so they can be echoed back in
/// `If-None-Match` / `If-Modified-Since` without reformatting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// `ETag` header value, quotes included.
    pub etag: Option<String>,
    /// `Last-Modified` header value in the server's original form.
    pub last_modified: Option<String>,
}

impl Validators {
    /// Parse validators out of a response header map.
    pub fn from_headers(headers: &header::HeaderMap) -> Self {
        let read = |name: header::HeaderName| {
            headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
        };
        Self { etag: read(header::ETAG), last_modified: read(header::LAST_MODIFIED) }
    }

    /// True when the server exposed neither validator.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// Fill gaps from previously cached validators. A `304 Not Modified`
    /// response is allowed to omit headers it would have sent on a 200.
    pub fn or_cached(mut self, cached: &Validators) -> Self {
        if self.etag.is_none() {
            self.etag = cached.etag.clone();
        }
        if self.last_modified.is_none() {
            self.last_modified = cached.last_modified.clone();
        }
        self
    }
}

/// Response from a full fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The canonicalized URL requested
    pub url: Url,
    /// The final URL after redirects
    pub final_url: Url,
    /// HTTP status code
    pub status: StatusCode,
    /// Content-Type header
    pub content_type: Option<String>,
    /// Response body bytes
    pub bytes: Bytes,
    /// Validators reported alongside the body
    pub validators: Validators,
    /// Time taken to fetch in milliseconds
    pub fetch_ms: u64,
}

/// Result of a fetch that may have been conditional.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The server sent a full body.
    Fresh(FetchResponse),
    /// The server answered `304 Not Modified`; no body was transferred.
    NotModified {
        /// Validators for the unchanged representation, falling back to the
        /// cached ones when the 304 omitted them.
        validators: Validators,
    },
}

/// Transport abstraction over HTTP fetches.
///
/// `probe` and `fetch` take URL strings and canonicalize internally, so the
/// record key stored by callers is always the form that was requested.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Issue a HEAD request and return the resource's current validators.
    async fn probe(&self, url: &str) -> Result<Validators, Error>;

    /// Fetch a URL. With `conditional` set, sends `If-None-Match` /
    /// `If-Modified-Since` and reports a 304 as `NotModified`.
    async fn fetch(&self, url: &str, conditional: Option<&Validators>) -> Result<FetchOutcome, Error>;
}

/// HTTP fetch client with safety checks.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
    robots_cache: RobotsCache,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::FetchFailed(format!("failed to build HTTP client: {}", e)))?;

        let robots_cache = RobotsCache::new(config.user_agent.clone());

        Ok(Self { http, config, robots_cache })
    }

    /// Robots and address gates shared by `probe` and `fetch`.
    async fn guard(&self, url: &Url) -> Result<(), Error> {
        if self.config.respect_robots {
            // Only an actual Disallow rule counts as a robots denial; a
            // robots.txt we could not retrieve is a transport problem.
            self.robots_cache.ensure_allowed(url).await.map_err(|e| match e {
                RobotsError::Disallowed { .. } => Error::RobotsDisallowed(e.to_string()),
                RobotsError::FetchError(_) | RobotsError::TooLarge => {
                    Error::FetchFailed(e.to_string())
                }
            })?;
        }

        if self.config.deny_private {
            let port = url.port_or_known_default().unwrap_or(443);
            match url.host() {
                Some(Host::Ipv4(ip)) => {
                    validate_ip(IpAddr::V4(ip)).map_err(|e| Error::SsrfBlocked(e.to_string()))?;
                }
                Some(Host::Ipv6(ip)) => {
                    validate_ip(IpAddr::V6(ip)).map_err(|e| Error::SsrfBlocked(e.to_string()))?;
                }
                Some(Host::Domain(domain)) => {
                    let addrs = tokio::net::lookup_host((domain, port))
                        .await
                        .map_err(|e| Error::FetchFailed(format!("dns lookup failed: {}", e)))?
                        .map(|sa| sa.ip());
                    validate_addrs(addrs).map_err(|e| Error::SsrfBlocked(e.to_string()))?;
                }
                None => return Err(Error::InvalidUrl("missing host".to_string())),
            }
        }

        Ok(())
    }

    /// Get reference to the robots cache.
    pub fn robots_cache(&self) -> &RobotsCache {
        &self.robots_cache
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }
}

/// Classify a reqwest transport error. Timeouts keep their own variant so
/// callers can distinguish them in logs; both classify as transport for the
/// change-detection fallback.
fn map_transport(err: reqwest::Error, what: &str) -> Error {
    if err.is_timeout() {
        Error::FetchTimeout(format!("{}: {}", what, err))
    } else {
        Error::FetchFailed(format!("{}: {}", what, err))
    }
}

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[async_trait]
impl Fetcher for FetchClient {
    async fn probe(&self, url_str: &str) -> Result<Validators, Error> {
        let url = canonicalize(url_str).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        self.guard(&url).await?;

        let response = self
            .http
            .head(url.as_str())
            .send()
            .await
            .map_err(|e| map_transport(e, "head request failed"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpError(format!("status {}", status.as_u16())));
        }

        let validators = Validators::from_headers(response.headers());
        tracing::debug!("probed {}: etag={}", url, validators.etag.is_some());
        Ok(validators)
    }

    async fn fetch(&self, url_str: &str, conditional: Option<&Validators>) -> Result<FetchOutcome, Error> {
        let start = Instant::now();
        let url = canonicalize(url_str).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        self.guard(&url).await?;

        let mut request = self.http.get(url.as_str());
        request = request.header(header::ACCEPT, ACCEPT_HTML);

        if let Some(validators) = conditional {
            if let Some(etag) = &validators.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &validators.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await.map_err(|e| map_transport(e, "request failed"))?;

        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            let mut validators = Validators::from_headers(response.headers());
            if let Some(cached) = conditional {
                validators = validators.or_cached(cached);
            }
            tracing::debug!("not modified: {}", url);
            return Ok(FetchOutcome::NotModified { validators });
        }

        if !status.is_success() {
            return Err(Error::HttpError(format!("status {}", status.as_u16())));
        }

        let content_length = response.content_length();
        if let Some(len) = content_length
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!(
                "{} bytes exceeds {}",
                len, self.config.max_bytes
            )));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_transport(e, "failed to read response"))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!(
                "{} bytes exceeds {}",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let validators = Validators::from_headers(&headers);
        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            "fetched {} -> {} in {}ms ({} bytes)",
            url,
            final_url,
            fetch_ms,
            bytes.len()
        );

        Ok(FetchOutcome::Fresh(FetchResponse {
            url,
            final_url,
            status,
            content_type,
            bytes,
            validators,
            fetch_ms,
        }))
    }
}
