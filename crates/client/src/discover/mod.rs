//! Candidate discovery.
//!
//! A source's candidate set comes from its sitemap when one is reachable:
//! either the URL configured on the source, or one advertised by the origin's
//! robots.txt. When neither works out the source degrades to its static seed
//! list, so a broken manifest slows a source down but does not blank it.

pub mod sitemap;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use quarry_core::{Error, SourceSpec};

use crate::fetch::{FetchClient, FetchOutcome, Fetcher, canonical_key, canonicalize};
use sitemap::{Sitemap, parse_sitemap};

/// A resource nominated for indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Canonical URL, usable directly as a record key.
    pub url: String,
    /// The manifest's modification claim for this resource, when published.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Produces the candidate set for a configured source.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self, source: &SourceSpec) -> Result<Vec<Candidate>, Error>;
}

/// Upper bound on child sitemaps followed from one sitemap index.
const MAX_CHILD_SITEMAPS: usize = 32;

/// Sitemap-driven discovery with seed-list fallback.
pub struct SitemapDiscovery {
    fetcher: Arc<FetchClient>,
}

impl SitemapDiscovery {
    pub fn new(fetcher: Arc<FetchClient>) -> Self {
        Self { fetcher }
    }

    /// Sitemap URL for a source: explicit configuration first, then the
    /// first `Sitemap:` directive in the robots.txt of the first seed's
    /// origin.
    async fn sitemap_url(&self, source: &SourceSpec) -> Option<String> {
        if let Some(url) = &source.sitemap {
            return Some(url.clone());
        }

        let seed = source.seeds.first()?;
        let origin = canonicalize(seed).ok()?;
        match self.fetcher.robots_cache().sitemaps_for(&origin).await {
            Ok(mut sitemaps) if !sitemaps.is_empty() => Some(sitemaps.remove(0)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("robots.txt sitemap lookup failed for {}: {}", source.name, e);
                None
            }
        }
    }

    async fn fetch_xml(&self, url: &str) -> Result<String, Error> {
        match self.fetcher.fetch(url, None).await? {
            FetchOutcome::Fresh(response) => {
                Ok(String::from_utf8_lossy(&response.bytes).into_owned())
            }
            FetchOutcome::NotModified { .. } => {
                Err(Error::DiscoveryFailed(format!("unexpected 304 for {}", url)))
            }
        }
    }

    async fn from_sitemap(&self, sitemap_url: &str) -> Result<Vec<Candidate>, Error> {
        let xml = self.fetch_xml(sitemap_url).await?;

        let entries = match parse_sitemap(&xml) {
            Sitemap::UrlSet(entries) => entries,
            Sitemap::Index(children) => {
                let mut entries = Vec::new();
                for child in children.into_iter().take(MAX_CHILD_SITEMAPS) {
                    match self.fetch_xml(&child).await {
                        Ok(child_xml) => match parse_sitemap(&child_xml) {
                            Sitemap::UrlSet(mut child_entries) => {
                                entries.append(&mut child_entries);
                            }
                            // one level of nesting only
                            Sitemap::Index(_) => {
                                tracing::warn!("skipping nested sitemap index: {}", child);
                            }
                        },
                        Err(e) => {
                            tracing::warn!("skipping unreachable child sitemap {}: {}", child, e);
                        }
                    }
                }
                entries
            }
        };

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for entry in entries {
            let url = match canonical_key(&entry.loc) {
                Ok(url) => url,
                Err(e) => {
                    tracing::debug!("skipping invalid sitemap loc {}: {}", entry.loc, e);
                    continue;
                }
            };
            if seen.insert(url.clone()) {
                candidates.push(Candidate { url, last_modified: entry.last_modified });
            }
        }
        Ok(candidates)
    }

    fn from_seeds(source: &SourceSpec) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for seed in &source.seeds {
            match canonical_key(seed) {
                Ok(url) => {
                    if seen.insert(url.clone()) {
                        candidates.push(Candidate { url, last_modified: None });
                    }
                }
                Err(e) => tracing::debug!("skipping invalid seed {}: {}", seed, e),
            }
        }
        candidates
    }
}

#[async_trait]
impl Discovery for SitemapDiscovery {
    async fn discover(&self, source: &SourceSpec) -> Result<Vec<Candidate>, Error> {
        if let Some(sitemap_url) = self.sitemap_url(source).await {
            match self.from_sitemap(&sitemap_url).await {
                Ok(candidates) if !candidates.is_empty() => {
                    tracing::debug!(
                        "discovered {} candidates for {} from {}",
                        candidates.len(),
                        source.name,
                        sitemap_url
                    );
                    return Ok(candidates);
                }
                Ok(_) => {
                    tracing::warn!("sitemap {} yielded no candidates, using seeds", sitemap_url);
                }
                Err(e) => {
                    tracing::warn!("sitemap {} unusable ({}), using seeds", sitemap_url, e);
                }
            }
        }

        let candidates = Self::from_seeds(source);
        if candidates.is_empty() {
            return Err(Error::DiscoveryFailed(format!(
                "source '{}' has no reachable sitemap and no usable seeds",
                source.name
            )));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use httpmock::Method::GET;
    use httpmock::MockServer;

    use crate::fetch::FetchConfig;

    fn discovery() -> SitemapDiscovery {
        let config =
            FetchConfig { respect_robots: false, deny_private: false, ..FetchConfig::default() };
        SitemapDiscovery::new(Arc::new(FetchClient::new(config).unwrap()))
    }

    fn source(sitemap: Option<String>, seeds: Vec<String>) -> SourceSpec {
        SourceSpec { name: "docs".to_string(), sitemap, seeds }
    }

    #[tokio::test]
    async fn test_discover_from_urlset() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sitemap.xml");
                then.status(200).body(format!(
                    "<urlset>\
                     <url><loc>{0}/docs/A</loc><lastmod>2024-02-01</lastmod></url>\
                     <url><loc>{0}/docs/b</loc></url>\
                     <url><loc>{0}/docs/A</loc></url>\
                     </urlset>",
                    server.base_url()
                ));
            })
            .await;

        let candidates = discovery()
            .discover(&source(Some(server.url("/sitemap.xml")), Vec::new()))
            .await
            .unwrap();

        // canonicalized and deduped
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].url.ends_with("/docs/A"));
        assert!(candidates[0].last_modified.is_some());
        assert!(candidates[1].url.ends_with("/docs/b"));
        assert_eq!(candidates[1].last_modified, None);
    }

    #[tokio::test]
    async fn test_discover_follows_index_one_level() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sitemap.xml");
                then.status(200).body(format!(
                    "<sitemapindex>\
                     <sitemap><loc>{0}/sitemap-a.xml</loc></sitemap>\
                     <sitemap><loc>{0}/sitemap-b.xml</loc></sitemap>\
                     </sitemapindex>",
                    server.base_url()
                ));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sitemap-a.xml");
                then.status(200).body(format!(
                    "<urlset><url><loc>{}/a</loc></url></urlset>",
                    server.base_url()
                ));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sitemap-b.xml");
                then.status(200).body(format!(
                    "<urlset><url><loc>{}/b</loc></url></urlset>",
                    server.base_url()
                ));
            })
            .await;

        let candidates = discovery()
            .discover(&source(Some(server.url("/sitemap.xml")), Vec::new()))
            .await
            .unwrap();

        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.url.ends_with("/a")));
        assert!(candidates.iter().any(|c| c.url.ends_with("/b")));
    }

    #[tokio::test]
    async fn test_discover_falls_back_to_seeds() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/sitemap.xml");
                then.status(500);
            })
            .await;

        let seeds = vec![server.url("/docs/start"), server.url("/docs/start")];
        let candidates = discovery()
            .discover(&source(Some(server.url("/sitemap.xml")), seeds))
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].url.ends_with("/docs/start"));
        assert_eq!(candidates[0].last_modified, None);
    }

    #[tokio::test]
    async fn test_discover_uses_robots_sitemap_directive() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/robots.txt");
                then.status(200)
                    .body(format!("User-agent: *\nSitemap: {}/from-robots.xml\n", server.base_url()));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/from-robots.xml");
                then.status(200).body(format!(
                    "<urlset><url><loc>{}/found</loc></url></urlset>",
                    server.base_url()
                ));
            })
            .await;

        let candidates = discovery()
            .discover(&source(None, vec![server.url("/docs/seed")]))
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].url.ends_with("/found"));
    }

    #[tokio::test]
    async fn test_discover_nothing_usable_is_an_error() {
        let result = discovery().discover(&source(None, vec!["http://".to_string()])).await;
        assert!(matches!(result, Err(Error::DiscoveryFailed(_))));
    }
}
