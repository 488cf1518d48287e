//! End-to-end indexing run scenarios over a mock HTTP origin, an in-memory
//! SQLite store, and a counting mock embedder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use httpmock::Method::{GET, HEAD};
use httpmock::MockServer;

use quarry_client::discover::{Candidate, Discovery};
use quarry_client::extract::DomExtractor;
use quarry_client::fetch::{FetchClient, FetchConfig};
use quarry_core::config::SourceSpec;
use quarry_core::store::{LeaseGrant, MetadataStore, RecordPatch, RecordQuery};
use quarry_core::{Error, SqliteStore};
use quarry_indexer::{
    CancelFlag, EmbeddingClient, Indexer, RetryPolicy, RunOptions, SqliteVectorSink, VectorSink,
};

const PAGE: &str = "<html><head><title>Doc A</title></head><body><main>\
    <p>Alpha beta gamma delta.</p><p>Second paragraph of prose.</p>\
    </main></body></html>";

struct StaticDiscovery(Vec<Candidate>);

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, _source: &SourceSpec) -> Result<Vec<Candidate>, Error> {
        Ok(self.0.clone())
    }
}

/// Embedder that fails its first `fail_first` calls with a transient error,
/// counting every call so tests can observe retry behavior.
struct CountingEmbedder {
    calls: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl EmbeddingClient for CountingEmbedder {
    fn model_id(&self) -> &str {
        "test-embed"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(Error::EmbedUnavailable(format!("induced failure {call}")));
        }
        Ok(vec![vec![0.1, 0.2, 0.3]; texts.len()])
    }
}

struct Harness {
    store: SqliteStore,
    sink: SqliteVectorSink,
    embedder: Arc<CountingEmbedder>,
    indexer: Indexer,
}

fn run_options(batch_width: usize) -> RunOptions {
    RunOptions {
        batch_width,
        batch_pause: Duration::from_millis(1),
        lease_ttl: Duration::from_secs(60),
        chunk_max_chars: 2000,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
        },
    }
}

fn build_indexer(
    store: &SqliteStore,
    sink: &SqliteVectorSink,
    candidates: Vec<Candidate>,
    embedder: Arc<dyn EmbeddingClient>,
    options: RunOptions,
) -> Indexer {
    let fetch_config =
        FetchConfig { respect_robots: false, deny_private: false, ..FetchConfig::default() };
    Indexer::new(
        Arc::new(store.clone()),
        Arc::new(StaticDiscovery(candidates)),
        Arc::new(FetchClient::new(fetch_config).unwrap()),
        Arc::new(DomExtractor),
        embedder,
        Arc::new(sink.clone()),
        options,
    )
}

async fn harness(candidates: Vec<Candidate>, fail_first: usize) -> Harness {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let sink = SqliteVectorSink::new(&store);
    let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0), fail_first });
    let indexer = build_indexer(&store, &sink, candidates, embedder.clone(), run_options(2));
    Harness { store, sink, embedder, indexer }
}

fn source() -> SourceSpec {
    SourceSpec { name: "docs".to_string(), sitemap: None, seeds: Vec::new() }
}

fn candidate(url: String) -> Candidate {
    Candidate { url, last_modified: None }
}

/// Every indexed record must point at the body it was indexed from.
async fn assert_invariant(store: &SqliteStore) {
    for record in store.query(RecordQuery::default()).await.unwrap() {
        if record.indexed {
            assert!(record.content_hash.is_some(), "indexed without hash: {}", record.url);
            assert!(record.body_ref.is_some(), "indexed without body: {}", record.url);
        }
    }
}

#[tokio::test]
async fn test_first_run_indexes_new_resource() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).header("etag", "\"v1\"").body(PAGE);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 0).await;

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(report.success);
    assert_eq!(report.indexed_count, 1);
    assert_eq!(report.skipped_count, 0);
    assert!(report.errors.is_empty());

    let record = h.store.get(&url).await.unwrap().unwrap();
    assert!(record.indexed);
    assert_eq!(record.etag.as_deref(), Some("\"v1\""));
    assert!(record.content_hash.is_some());
    assert!(record.last_checked_at.is_some());

    assert!(h.sink.count_for(&url).await.unwrap() > 0);
    assert_invariant(&h.store).await;
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).header("etag", "\"v1\"").body(PAGE);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/docs/a");
            then.status(200).header("etag", "\"v1\"");
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 0).await;

    let first = h.indexer.run(&source(), false).await.unwrap();
    assert_eq!(first.indexed_count, 1);

    let second = h.indexer.run(&source(), false).await.unwrap();
    assert!(second.success);
    assert_eq!(second.indexed_count, 0);
    assert_eq!(second.skipped_count, 1);

    // The matching-etag probe answered; the body was fetched exactly once.
    get.assert_hits_async(1).await;
    assert_invariant(&h.store).await;
}

#[tokio::test]
async fn test_embed_retry_recovers() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).body(PAGE);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 2).await;

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(report.success);
    assert_eq!(report.indexed_count, 1);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 3);

    assert!(h.store.get(&url).await.unwrap().unwrap().indexed);
}

#[tokio::test]
async fn test_embed_exhaustion_recorded_not_fatal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).body(PAGE);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 10).await;

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.indexed_count, 0);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].url, url);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 3);

    // The record survives unindexed and the invariant holds.
    assert!(!h.store.get(&url).await.unwrap().unwrap().indexed);
    assert_eq!(h.sink.count_for(&url).await.unwrap(), 0);
    assert_invariant(&h.store).await;
}

#[tokio::test]
async fn test_force_refresh_reprocesses_everything() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).header("etag", "\"v1\"").body(PAGE);
        })
        .await;
    let head = server
        .mock_async(|when, then| {
            when.method(HEAD).path("/docs/a");
            then.status(200).header("etag", "\"v1\"");
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 0).await;

    h.indexer.run(&source(), false).await.unwrap();
    let forced = h.indexer.run(&source(), true).await.unwrap();

    assert_eq!(forced.indexed_count, 1);
    assert_eq!(forced.skipped_count, 0);
    // Force bypasses detection entirely.
    head.assert_hits_async(0).await;
    get.assert_hits_async(2).await;
}

#[tokio::test]
async fn test_prefilter_skips_without_any_request() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/docs");
            then.status(200).body(PAGE);
        })
        .await;
    let head = server
        .mock_async(|when, then| {
            when.method(HEAD).path_contains("/docs");
            then.status(200);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(
        vec![Candidate {
            url: url.clone(),
            last_modified: Some(chrono::Utc::now() - chrono::Duration::hours(2)),
        }],
        0,
    )
    .await;

    // Checked an hour ago, manifest says modified two hours ago.
    h.store
        .upsert(RecordPatch {
            last_checked_at: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
            ..RecordPatch::new(&url, "docs")
        })
        .await
        .unwrap();

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(report.success);
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.indexed_count, 0);
    get.assert_hits_async(0).await;
    head.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_lease_conflict_returns_immediately() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).body(PAGE);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url)], 0).await;

    let grant = h.store.acquire_lease("docs", Duration::from_secs(60)).await.unwrap();
    assert!(matches!(grant, LeaseGrant::Granted { .. }));

    let err = h.indexer.run(&source(), false).await.unwrap_err();
    match err {
        Error::LeaseHeld { name, remaining_secs } => {
            assert_eq!(name, "docs");
            assert!(remaining_secs > 0);
        }
        other => panic!("expected lease conflict, got {other}"),
    }
    get.assert_hits_async(0).await;
}

#[tokio::test]
async fn test_lease_released_even_after_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/missing");
            then.status(404);
        })
        .await;

    let h = harness(vec![candidate(server.url("/docs/missing"))], 0).await;

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(!report.success);

    // The failed run let go of the lease.
    let grant = h.store.acquire_lease("docs", Duration::from_secs(60)).await.unwrap();
    assert!(matches!(grant, LeaseGrant::Granted { .. }));
}

#[tokio::test]
async fn test_resource_failure_does_not_abort_run() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/good");
            then.status(200).body(PAGE);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/bad");
            then.status(404);
        })
        .await;

    let good = server.url("/docs/good");
    let bad = server.url("/docs/bad");
    let h = harness(vec![candidate(good.clone()), candidate(bad.clone())], 0).await;

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.indexed_count, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].url, bad);

    assert!(h.store.get(&good).await.unwrap().unwrap().indexed);
    assert_invariant(&h.store).await;
}

#[tokio::test]
async fn test_hash_only_record_fetches_and_skips_when_equal() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).header("etag", "\"fresh\"").body(PAGE);
        })
        .await;
    let head = server
        .mock_async(|when, then| {
            when.method(HEAD).path("/docs/a");
            then.status(200);
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 0).await;

    // A record carrying only a content hash: no validators to probe with.
    let body_ref = h.store.save_body(PAGE.as_bytes()).await.unwrap();
    h.store
        .upsert(RecordPatch {
            content_hash: Some(body_ref.clone()),
            body_ref: Some(body_ref),
            indexed: Some(true),
            ..RecordPatch::new(&url, "docs")
        })
        .await
        .unwrap();

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.indexed_count, 0);
    head.assert_hits_async(0).await;
    get.assert_hits_async(1).await;

    // The equal-hash fetch still refreshed the validators.
    let record = h.store.get(&url).await.unwrap().unwrap();
    assert_eq!(record.etag.as_deref(), Some("\"fresh\""));
}

/// Embedder that trips a cancel flag on its first call, then succeeds.
struct CancellingEmbedder {
    flag: OnceLock<CancelFlag>,
}

#[async_trait]
impl EmbeddingClient for CancellingEmbedder {
    fn model_id(&self) -> &str {
        "test-embed"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        if let Some(flag) = self.flag.get() {
            flag.cancel();
        }
        Ok(vec![vec![0.1, 0.2, 0.3]; texts.len()])
    }
}

#[tokio::test]
async fn test_cancel_drains_batch_and_releases_lease() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/docs/");
            then.status(200).body(PAGE);
        })
        .await;

    let candidates: Vec<Candidate> =
        (0..3).map(|i| candidate(server.url(format!("/docs/{i}")))).collect();
    let urls: Vec<String> = candidates.iter().map(|c| c.url.clone()).collect();

    let store = SqliteStore::open_in_memory().await.unwrap();
    let sink = SqliteVectorSink::new(&store);
    let embedder = Arc::new(CancellingEmbedder { flag: OnceLock::new() });
    let indexer = build_indexer(&store, &sink, candidates, embedder.clone(), run_options(1));
    embedder.flag.set(indexer.cancel_flag()).unwrap();

    let report = indexer.run(&source(), false).await.unwrap();

    // The in-flight batch drained and committed; later batches never started.
    assert!(report.success);
    assert_eq!(report.indexed_count, 1);
    assert!(report.errors.is_empty());
    get.assert_hits_async(1).await;
    assert!(store.get(&urls[0]).await.unwrap().unwrap().indexed);
    assert!(!store.get(&urls[1]).await.unwrap().unwrap().indexed);
    assert!(!store.get(&urls[2]).await.unwrap().unwrap().indexed);

    // A cancelled run still lets go of the lease.
    let grant = store.acquire_lease("docs", Duration::from_secs(60)).await.unwrap();
    assert!(matches!(grant, LeaseGrant::Granted { .. }));
    assert_invariant(&store).await;
}

struct PanickingEmbedder;

#[async_trait]
impl EmbeddingClient for PanickingEmbedder {
    fn model_id(&self) -> &str {
        "test-embed"
    }

    fn dimensions(&self) -> usize {
        3
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, Error> {
        panic!("embedder bug");
    }
}

#[tokio::test]
async fn test_panicked_worker_error_names_its_resource() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).body(PAGE);
        })
        .await;

    let url = server.url("/docs/a");
    let store = SqliteStore::open_in_memory().await.unwrap();
    let sink = SqliteVectorSink::new(&store);
    let indexer = build_indexer(
        &store,
        &sink,
        vec![candidate(url.clone())],
        Arc::new(PanickingEmbedder),
        run_options(2),
    );

    let report = indexer.run(&source(), false).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].url, url);

    // The panic neither poisoned the run nor leaked the lease.
    let grant = store.acquire_lease("docs", Duration::from_secs(60)).await.unwrap();
    assert!(matches!(grant, LeaseGrant::Granted { .. }));
}

#[tokio::test]
async fn test_unchanged_but_unindexed_reembeds_from_cached_body() {
    let server = MockServer::start_async().await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path("/docs/a");
            then.status(200).body(PAGE);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(HEAD).path("/docs/a");
            then.status(200).header("etag", "\"v1\"");
        })
        .await;

    let url = server.url("/docs/a");
    let h = harness(vec![candidate(url.clone())], 0).await;

    // A prior run fetched and cached the body but failed to embed.
    let body_ref = h.store.save_body(PAGE.as_bytes()).await.unwrap();
    h.store
        .upsert(RecordPatch {
            etag: Some("\"v1\"".to_string()),
            content_hash: Some(body_ref.clone()),
            body_ref: Some(body_ref),
            ..RecordPatch::new(&url, "docs")
        })
        .await
        .unwrap();

    let report = h.indexer.run(&source(), false).await.unwrap();
    assert!(report.success);
    assert_eq!(report.indexed_count, 1);
    // Content was current; no body transfer happened.
    get.assert_hits_async(0).await;

    let record = h.store.get(&url).await.unwrap().unwrap();
    assert!(record.indexed);
    assert!(h.sink.count_for(&url).await.unwrap() > 0);
    assert_invariant(&h.store).await;
}
