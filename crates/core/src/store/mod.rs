//! SQLite-backed metadata store for the indexing pipeline.
//!
//! This module is the single source of truth consulted before any network
//! fetch. It provides, over one SQLite file with async access via
//! tokio-rusqlite:
//!
//! - Per-resource cache records (validators, content hash, index status)
//! - Content-addressed body storage
//! - Advisory leases serializing indexing runs per source
//! - Automatic schema migrations
//! - WAL mode for concurrent access
//!
//! The [`MetadataStore`] trait is the seam the orchestrator depends on;
//! [`SqliteStore`] is the embedded implementation. Alternative backends can
//! be added without touching the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite;

pub mod bodies;
pub mod connection;
pub mod leases;
pub mod migrations;
pub mod records;

pub use crate::Error;

pub use bodies::content_hash;
pub use connection::SqliteStore;
pub use leases::{Lease, LeaseGrant};
pub use records::{CacheRecord, RecordPatch, RecordQuery, SourceStats};

/// Parse an RFC 3339 column written by this store.
pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Capability set the indexing pipeline requires from a metadata store.
///
/// Every mutating operation is individually atomic at the storage layer;
/// callers layer no locking on top beyond the lease itself.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Point read by canonical URL.
    async fn get(&self, url: &str) -> Result<Option<CacheRecord>, Error>;

    /// Insert-or-merge one record; always refreshes `updated_at`.
    async fn upsert(&self, patch: RecordPatch) -> Result<(), Error>;

    /// All-or-nothing transactional batch of upserts.
    async fn bulk_upsert(&self, patches: Vec<RecordPatch>) -> Result<(), Error>;

    /// Filtered read; all filters optional and AND-combined.
    async fn query(&self, filter: RecordQuery) -> Result<Vec<CacheRecord>, Error>;

    /// Per-source record totals.
    async fn aggregate_by_source(&self) -> Result<Vec<SourceStats>, Error>;

    /// Store a fetched body, returning the reference to put on its record.
    async fn save_body(&self, bytes: &[u8]) -> Result<String, Error>;

    /// Load a body by reference.
    async fn load_body(&self, body_ref: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Atomically acquire the named lease, or learn its remaining TTL.
    async fn acquire_lease(&self, name: &str, ttl: Duration) -> Result<LeaseGrant, Error>;

    /// Release the named lease if the holder matches.
    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, Error>;

    /// Drop every expired lease row.
    async fn reap_expired_leases(&self) -> Result<u64, Error>;
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn get(&self, url: &str) -> Result<Option<CacheRecord>, Error> {
        self.get_record(url).await
    }

    async fn upsert(&self, patch: RecordPatch) -> Result<(), Error> {
        self.upsert_record(patch).await
    }

    async fn bulk_upsert(&self, patches: Vec<RecordPatch>) -> Result<(), Error> {
        self.bulk_upsert_records(patches).await
    }

    async fn query(&self, filter: RecordQuery) -> Result<Vec<CacheRecord>, Error> {
        self.query_records(filter).await
    }

    async fn aggregate_by_source(&self) -> Result<Vec<SourceStats>, Error> {
        SqliteStore::aggregate_by_source(self).await
    }

    async fn save_body(&self, bytes: &[u8]) -> Result<String, Error> {
        SqliteStore::save_body(self, bytes).await
    }

    async fn load_body(&self, body_ref: &str) -> Result<Option<Vec<u8>>, Error> {
        SqliteStore::load_body(self, body_ref).await
    }

    async fn acquire_lease(&self, name: &str, ttl: Duration) -> Result<LeaseGrant, Error> {
        SqliteStore::acquire_lease(self, name, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, Error> {
        SqliteStore::release_lease(self, name, holder).await
    }

    async fn reap_expired_leases(&self) -> Result<u64, Error> {
        SqliteStore::reap_expired_leases(self).await
    }
}
