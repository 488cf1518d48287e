//! Per-resource change detection.
//!
//! Decides whether a resource's remote content differs from the cached copy
//! using the cheapest signal that gives a confident answer: a cached ETag
//! against a header-only probe first, then the Last-Modified timestamps,
//! then a full fetch-and-hash comparison. A transport error anywhere in the
//! sequence falls back to the cached copy when at least one validator was
//! cached, so network flakiness never forces a needless re-index.

use std::sync::Arc;

use chrono::DateTime;

use quarry_client::fetch::{FetchOutcome, FetchResponse, Fetcher, Validators};
use quarry_core::store::content_hash;
use quarry_core::{CacheRecord, Error};

/// Verdict on one resource.
#[derive(Debug)]
pub enum Detection {
    /// Remote content matches the cached copy. The validators are the
    /// freshest known for the representation and should be written back.
    Unchanged { validators: Validators },
    /// Remote content differs; the fetched body rides along so it is never
    /// transferred twice.
    Changed { response: FetchResponse },
    /// Transport trouble while checking; trust the cached copy.
    AssumeUnchanged,
}

/// Validators as last recorded for a resource.
pub fn cached_validators(record: &CacheRecord) -> Validators {
    Validators { etag: record.etag.clone(), last_modified: record.last_modified.clone() }
}

/// Runs the detection sequence against a [`Fetcher`].
#[derive(Clone)]
pub struct ChangeDetector {
    fetcher: Arc<dyn Fetcher>,
}

/// Compare two HTTP-date strings; `None` when either fails to parse.
fn not_newer(current: &str, cached: &str) -> Option<bool> {
    let current = DateTime::parse_from_rfc2822(current).ok()?;
    let cached = DateTime::parse_from_rfc2822(cached).ok()?;
    Some(current <= cached)
}

impl ChangeDetector {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    /// Probe outcome: `Some(detection)` when the probe was decisive.
    ///
    /// An ETag pair is decisive both ways (a mismatch means the hash
    /// comparison should run without consulting a possibly stale
    /// Last-Modified). Probe-level HTTP errors (405 and friends) are
    /// inconclusive, not failures.
    async fn probe(&self, record: &CacheRecord, cached: &Validators) -> Result<Option<Detection>, Error> {
        let probed = match self.fetcher.probe(&record.url).await {
            Ok(probed) => probed,
            Err(e) if e.is_transport() => {
                tracing::debug!(url = %record.url, "probe transport error ({}), assuming unchanged", e);
                return Ok(Some(Detection::AssumeUnchanged));
            }
            Err(e) => {
                tracing::debug!(url = %record.url, "probe inconclusive ({})", e);
                return Ok(None);
            }
        };

        if let (Some(ours), Some(theirs)) = (&cached.etag, &probed.etag) {
            if ours == theirs {
                return Ok(Some(Detection::Unchanged { validators: probed.or_cached(cached) }));
            }
            return Ok(None);
        }

        if let (Some(ours), Some(theirs)) = (&cached.last_modified, &probed.last_modified)
            && not_newer(theirs, ours) == Some(true)
        {
            return Ok(Some(Detection::Unchanged { validators: probed.or_cached(cached) }));
        }

        Ok(None)
    }

    /// Run the detection sequence for a known record.
    pub async fn detect(&self, record: &CacheRecord) -> Result<Detection, Error> {
        let cached = cached_validators(record);
        let has_validators = !cached.is_empty();

        if has_validators
            && let Some(detection) = self.probe(record, &cached).await?
        {
            return Ok(detection);
        }

        // Ground truth: fetch and compare hashes. Conditional headers ride
        // along when validators exist; a 304 there is trusted as unchanged.
        let conditional = has_validators.then_some(&cached);
        match self.fetcher.fetch(&record.url, conditional).await {
            Ok(FetchOutcome::NotModified { validators }) => Ok(Detection::Unchanged { validators }),
            Ok(FetchOutcome::Fresh(response)) => {
                let hash = content_hash(&response.bytes);
                if record.content_hash.as_deref() == Some(hash.as_str()) {
                    let validators = response.validators.clone().or_cached(&cached);
                    Ok(Detection::Unchanged { validators })
                } else {
                    Ok(Detection::Changed { response })
                }
            }
            Err(e) if e.is_transport() && has_validators => {
                tracing::debug!(url = %record.url, "fetch transport error ({}), assuming unchanged", e);
                Ok(Detection::AssumeUnchanged)
            }
            Err(e) => Err(e),
        }
    }
}
