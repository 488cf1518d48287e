//! The indexing run.
//!
//! One [`Indexer::run`] call drives a full pass over a named source: take
//! the source's lease, discover candidates, pre-filter against cached state,
//! then push the survivors through detect → fetch → extract → chunk →
//! embed → store in bounded-width batches. Per-resource failures accumulate
//! into the [`RunReport`]; only store-level failures abort the run. The
//! lease is released on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use quarry_client::discover::{Candidate, Discovery};
use quarry_client::extract::Extractor;
use quarry_client::fetch::{FetchOutcome, FetchResponse, Fetcher, Validators};
use quarry_core::config::SourceSpec;
use quarry_core::store::{LeaseGrant, MetadataStore, RecordPatch, RecordQuery};
use quarry_core::{AppConfig, CacheRecord, Error};

use crate::chunk::Chunker;
use crate::detect::{ChangeDetector, Detection, cached_validators};
use crate::embed::EmbeddingClient;
use crate::report::RunReport;
use crate::retry::{RetryPolicy, with_backoff};
use crate::vector::{ChunkContext, VectorSink};

/// Run-level tunables, fixed for the duration of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// In-flight resources per batch.
    pub batch_width: usize,
    /// Pause between batches, for downstream rate limits.
    pub batch_pause: Duration,
    /// Lease time-to-live; sized to a full pass over the source.
    pub lease_ttl: Duration,
    /// Upper bound on chunk size, in characters.
    pub chunk_max_chars: usize,
    /// Backoff schedule for transient embedding failures.
    pub retry: RetryPolicy,
}

impl From<&AppConfig> for RunOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_width: config.batch_width.max(1),
            batch_pause: config.batch_pause(),
            lease_ttl: config.lease_ttl(),
            chunk_max_chars: config.chunk_max_chars,
            retry: RetryPolicy::from(config),
        }
    }
}

/// Cooperative cancellation handle, checked between batches. The in-flight
/// batch always drains so no resource is left partially committed.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How one resource settled.
enum Outcome {
    Indexed,
    Skipped,
}

/// Orchestrates indexing runs over the configured collaborators.
///
/// Cheap to clone; every worker task carries its own handle.
#[derive(Clone)]
pub struct Indexer {
    store: Arc<dyn MetadataStore>,
    discovery: Arc<dyn Discovery>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    embedder: Arc<dyn EmbeddingClient>,
    sink: Arc<dyn VectorSink>,
    detector: ChangeDetector,
    chunker: Chunker,
    options: RunOptions,
    cancel: CancelFlag,
}

/// True when the manifest proves the resource cannot have changed since the
/// record was last checked.
fn pre_filtered(candidate: &Candidate, record: &CacheRecord) -> bool {
    match (candidate.last_modified, record.last_checked_at) {
        (Some(manifest), Some(checked)) => manifest <= checked,
        _ => false,
    }
}

fn is_fatal(err: &Error) -> bool {
    matches!(err, Error::Store(_) | Error::MigrationFailed(_))
}

impl Indexer {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        discovery: Arc<dyn Discovery>,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
        embedder: Arc<dyn EmbeddingClient>,
        sink: Arc<dyn VectorSink>,
        options: RunOptions,
    ) -> Self {
        let detector = ChangeDetector::new(fetcher.clone());
        let chunker = Chunker::new(options.chunk_max_chars);
        Self {
            store,
            discovery,
            fetcher,
            extractor,
            embedder,
            sink,
            detector,
            chunker,
            options,
            cancel: CancelFlag::new(),
        }
    }

    /// Handle for aborting this indexer's runs between batches.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one indexing pass over `source`.
    ///
    /// Returns `Error::LeaseHeld` immediately when another run holds the
    /// source's lease; never blocks waiting for it. With `force_refresh`
    /// every discovered resource is re-fetched and re-embedded regardless of
    /// cached state.
    pub async fn run(&self, source: &SourceSpec, force_refresh: bool) -> Result<RunReport, Error> {
        if let Err(e) = self.store.reap_expired_leases().await {
            tracing::warn!(source = %source.name, "lease reaping failed: {}", e);
        }

        let holder = match self.store.acquire_lease(&source.name, self.options.lease_ttl).await? {
            LeaseGrant::Granted { holder } => holder,
            LeaseGrant::Held { remaining } => {
                return Err(Error::LeaseHeld {
                    name: source.name.clone(),
                    remaining_secs: remaining.as_secs().max(1),
                });
            }
        };

        let result = self.run_locked(source, force_refresh).await;

        match self.store.release_lease(&source.name, &holder).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(source = %source.name, "lease was no longer ours at release");
            }
            Err(e) => tracing::warn!(source = %source.name, "failed to release lease: {}", e),
        }

        result
    }

    async fn run_locked(&self, source: &SourceSpec, force_refresh: bool) -> Result<RunReport, Error> {
        let candidates = self.discovery.discover(source).await?;
        tracing::info!(
            source = %source.name,
            candidates = candidates.len(),
            force = force_refresh,
            "starting indexing run"
        );

        let known: HashMap<String, CacheRecord> = self
            .store
            .query(RecordQuery { source: Some(source.name.clone()), ..Default::default() })
            .await?
            .into_iter()
            .map(|record| (record.url.clone(), record))
            .collect();

        // First-seen candidates become records in one durability barrier.
        let seeds: Vec<RecordPatch> = candidates
            .iter()
            .filter(|c| !known.contains_key(&c.url))
            .map(|c| RecordPatch::new(&c.url, &source.name))
            .collect();
        self.store.bulk_upsert(seeds).await?;

        let mut report = RunReport::default();
        let mut work = Vec::new();
        for candidate in candidates {
            let record = known.get(&candidate.url).cloned();
            if !force_refresh
                && let Some(record) = &record
                && pre_filtered(&candidate, record)
            {
                tracing::debug!(url = %candidate.url, "pre-filtered by manifest timestamp");
                report.record_skipped();
                continue;
            }
            work.push((candidate.url, record));
        }

        let mut pending = work.into_iter();
        let mut first = true;
        loop {
            let batch: Vec<_> = pending.by_ref().take(self.options.batch_width).collect();
            if batch.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                tracing::info!(source = %source.name, "run cancelled, stopping before next batch");
                break;
            }
            if !first {
                tokio::time::sleep(self.options.batch_pause).await;
            }
            first = false;

            let mut tasks = JoinSet::new();
            // Task ids map back to URLs so even a panicked worker's error
            // names its resource.
            let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
            for (url, record) in batch {
                let indexer = self.clone();
                let source_name = source.name.clone();
                let task_url = url.clone();
                let handle = tasks.spawn(async move {
                    indexer.process(&task_url, record, force_refresh, &source_name).await
                });
                in_flight.insert(handle.id(), url);
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                match joined {
                    Ok((id, outcome)) => {
                        let url = in_flight.remove(&id).unwrap_or_default();
                        match outcome {
                            Ok(Outcome::Indexed) => report.record_indexed(),
                            Ok(Outcome::Skipped) => report.record_skipped(),
                            Err(e) if is_fatal(&e) => return Err(e),
                            Err(e) => {
                                tracing::debug!(url = %url, "resource failed: {}", e);
                                report.record_error(url, &e);
                            }
                        }
                    }
                    Err(join_err) => {
                        // A panicked worker loses exactly its own resource.
                        let url = in_flight.remove(&join_err.id()).unwrap_or_default();
                        tracing::warn!(url = %url, "resource task panicked");
                        let err = Error::InvalidInput("resource task panicked".to_string());
                        report.record_error(url, &err);
                    }
                }
            }
        }

        let report = report.finish();
        tracing::info!(
            source = %source.name,
            indexed = report.indexed_count,
            skipped = report.skipped_count,
            errors = report.errors.len(),
            "indexing run finished"
        );
        Ok(report)
    }

    /// Bring one resource up to date: the strictly sequential
    /// detect → fetch → extract → chunk → embed → commit pipeline.
    async fn process(
        &self,
        url: &str,
        record: Option<CacheRecord>,
        force_refresh: bool,
        source: &str,
    ) -> Result<Outcome, Error> {
        let record = match record {
            Some(record) if !force_refresh => record,
            _ => {
                let response = self.fetch_fresh(url).await?;
                return self.index_response(url, source, response).await;
            }
        };
        match self.detector.detect(&record).await? {
            Detection::Changed { response } => self.index_response(url, source, response).await,
            Detection::Unchanged { validators } => {
                if record.indexed {
                    self.touch(url, source, Some(validators)).await?;
                    return Ok(Outcome::Skipped);
                }
                // A prior embed failed; the content is current but never
                // made it into the index. Reuse the cached body.
                self.reindex_cached(url, source, &record, validators).await
            }
            Detection::AssumeUnchanged => {
                if record.indexed {
                    self.touch(url, source, None).await?;
                    return Ok(Outcome::Skipped);
                }
                let validators = cached_validators(&record);
                self.reindex_cached(url, source, &record, validators).await
            }
        }
    }

    async fn fetch_fresh(&self, url: &str) -> Result<FetchResponse, Error> {
        match self.fetcher.fetch(url, None).await? {
            FetchOutcome::Fresh(response) => Ok(response),
            FetchOutcome::NotModified { .. } => {
                Err(Error::HttpError("304 to an unconditional request".to_string()))
            }
        }
    }

    /// Record a staleness evaluation without touching content state.
    async fn touch(&self, url: &str, source: &str, validators: Option<Validators>) -> Result<(), Error> {
        let validators = validators.unwrap_or_default();
        self.store
            .upsert(RecordPatch {
                etag: validators.etag,
                last_modified: validators.last_modified,
                last_checked_at: Some(Utc::now()),
                ..RecordPatch::new(url, source)
            })
            .await
    }

    /// Index a freshly fetched body.
    async fn index_response(
        &self,
        url: &str,
        source: &str,
        response: FetchResponse,
    ) -> Result<Outcome, Error> {
        let body_ref = self.store.save_body(&response.bytes).await?;
        self.embed_and_commit(url, source, &response.bytes, body_ref, response.validators).await
    }

    /// Re-embed a resource from its cached body, falling back to a fresh
    /// fetch when the blob has gone missing.
    async fn reindex_cached(
        &self,
        url: &str,
        source: &str,
        record: &CacheRecord,
        validators: Validators,
    ) -> Result<Outcome, Error> {
        let cached = match &record.body_ref {
            Some(body_ref) => self.store.load_body(body_ref).await?.map(|bytes| (bytes, body_ref.clone())),
            None => None,
        };

        match cached {
            Some((bytes, body_ref)) => self.embed_and_commit(url, source, &bytes, body_ref, validators).await,
            None => {
                tracing::warn!(url = %url, "cached body missing, re-fetching");
                let response = self.fetch_fresh(url).await?;
                self.index_response(url, source, response).await
            }
        }
    }

    /// Extract, chunk, embed, store vectors, then commit the record. The
    /// `indexed` flag is written only after the vectors are in place.
    async fn embed_and_commit(
        &self,
        url: &str,
        source: &str,
        bytes: &[u8],
        body_ref: String,
        validators: Validators,
    ) -> Result<Outcome, Error> {
        let html = String::from_utf8_lossy(bytes);
        let extraction = self.extractor.extract(&html)?;

        let chunks = self.chunker.split(&extraction.text);
        if chunks.is_empty() {
            return Err(Error::ExtractFailed("no indexable text".to_string()));
        }

        let vectors =
            with_backoff(&self.options.retry, "embed", || self.embedder.embed(&chunks)).await?;

        let context = ChunkContext {
            source: source.to_string(),
            title: extraction.title.clone(),
            model: self.embedder.model_id().to_string(),
        };
        self.sink.store(url, chunks, vectors, context).await?;

        self.store
            .upsert(RecordPatch {
                etag: validators.etag,
                last_modified: validators.last_modified,
                content_hash: Some(body_ref.clone()),
                body_ref: Some(body_ref),
                last_checked_at: Some(Utc::now()),
                indexed: Some(true),
                ..RecordPatch::new(url, source)
            })
            .await?;

        tracing::debug!(url = %url, "indexed");
        Ok(Outcome::Indexed)
    }
}
