//! Cache record CRUD operations.
//!
//! A `CacheRecord` is the per-resource memory of the pipeline: which
//! validators the server sent last time, what the body hashed to, where the
//! body is stored, and whether the content has been embedded. Writes go
//! through `RecordPatch` with insert-or-merge semantics so concurrent
//! callers and partial updates never clobber fields they did not set.

use super::connection::SqliteStore;
use super::parse_timestamp;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;
use tokio_rusqlite::rusqlite::params_from_iter;
use tokio_rusqlite::rusqlite::types::Value;

/// A cached resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub url: String,
    pub source: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    pub body_ref: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub indexed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-merge write against one record.
///
/// `url` and `source` are always written; every `Option` field is applied
/// only when `Some`, preserving the prior value otherwise. `updated_at` is
/// refreshed on every write.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub url: String,
    pub source: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    pub body_ref: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub indexed: Option<bool>,
}

impl RecordPatch {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self { url: url.into(), source: source.into(), ..Default::default() }
    }
}

/// Composable record filter; all fields optional, AND-combined.
/// Timestamp bounds are exclusive.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub source: Option<String>,
    pub indexed: Option<bool>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

/// Per-source rollup returned by `aggregate_by_source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub total: u64,
    pub indexed_count: u64,
    pub last_updated: DateTime<Utc>,
}

const RECORD_COLUMNS: &str = "url, source, etag, last_modified, content_hash, body_ref, last_checked_at, indexed, created_at, updated_at";

const UPSERT_SQL: &str = "INSERT INTO records (
        url, source, etag, last_modified, content_hash, body_ref,
        last_checked_at, indexed, created_at, updated_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 0), ?9, ?9)
    ON CONFLICT(url) DO UPDATE SET
        source = excluded.source,
        etag = COALESCE(excluded.etag, etag),
        last_modified = COALESCE(excluded.last_modified, last_modified),
        content_hash = COALESCE(excluded.content_hash, content_hash),
        body_ref = COALESCE(excluded.body_ref, body_ref),
        last_checked_at = COALESCE(excluded.last_checked_at, last_checked_at),
        indexed = CASE WHEN ?8 IS NULL THEN indexed ELSE excluded.indexed END,
        updated_at = excluded.updated_at";

fn map_record(row: &rusqlite::Row<'_>) -> Result<CacheRecord, rusqlite::Error> {
    Ok(CacheRecord {
        url: row.get(0)?,
        source: row.get(1)?,
        etag: row.get(2)?,
        last_modified: row.get(3)?,
        content_hash: row.get(4)?,
        body_ref: row.get(5)?,
        last_checked_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_timestamp(6, &raw))
            .transpose()?,
        indexed: row.get::<_, i64>(7)? == 1,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}

fn exec_upsert(conn: &rusqlite::Connection, patch: &RecordPatch, now: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        UPSERT_SQL,
        params![
            &patch.url,
            &patch.source,
            &patch.etag,
            &patch.last_modified,
            &patch.content_hash,
            &patch.body_ref,
            patch.last_checked_at.map(|t| t.to_rfc3339()),
            patch.indexed,
            now,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    /// Get a record by canonical URL.
    ///
    /// Returns None if the resource has never been seen.
    pub async fn get_record(&self, url: &str) -> Result<Option<CacheRecord>, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheRecord>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT {RECORD_COLUMNS} FROM records WHERE url = ?1"))?;
                let result = stmt.query_row(params![url], map_record);

                match result {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or merge a single record. Atomic per call.
    pub async fn upsert_record(&self, patch: RecordPatch) -> Result<(), Error> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                exec_upsert(conn, &patch, &now)?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or merge a batch of records in one transaction.
    ///
    /// All-or-nothing: if any patch fails (e.g., a constraint violation),
    /// no patch in the batch is applied.
    pub async fn bulk_upsert_records(&self, patches: Vec<RecordPatch>) -> Result<(), Error> {
        if patches.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                for patch in &patches {
                    exec_upsert(&tx, patch, &now)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Filtered read over records, ordered by URL. No side effects.
    pub async fn query_records(&self, filter: RecordQuery) -> Result<Vec<CacheRecord>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<CacheRecord>, Error> {
                let mut clauses: Vec<&str> = Vec::new();
                let mut values: Vec<Value> = Vec::new();

                if let Some(source) = filter.source {
                    clauses.push("source = ?");
                    values.push(Value::Text(source));
                }
                if let Some(indexed) = filter.indexed {
                    clauses.push("indexed = ?");
                    values.push(Value::Integer(i64::from(indexed)));
                }
                if let Some(after) = filter.updated_after {
                    clauses.push("updated_at > ?");
                    values.push(Value::Text(after.to_rfc3339()));
                }
                if let Some(before) = filter.updated_before {
                    clauses.push("updated_at < ?");
                    values.push(Value::Text(before.to_rfc3339()));
                }

                let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records");
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY url ASC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), map_record)?;
                let mut records = Vec::new();
                for row in rows {
                    records.push(row?);
                }
                Ok(records)
            })
            .await
            .map_err(Error::from)
    }

    /// Per-source totals: record count, indexed count, most recent update.
    pub async fn aggregate_by_source(&self) -> Result<Vec<SourceStats>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<SourceStats>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT source, COUNT(*), SUM(indexed), MAX(updated_at)
                     FROM records GROUP BY source ORDER BY source ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(SourceStats {
                        source: row.get(0)?,
                        total: row.get::<_, i64>(1)? as u64,
                        indexed_count: row.get::<_, i64>(2)? as u64,
                        last_updated: parse_timestamp(3, &row.get::<_, String>(3)?)?,
                    })
                })?;
                let mut stats = Vec::new();
                for row in rows {
                    stats.push(row?);
                }
                Ok(stats)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory().await.unwrap()
    }

    fn indexed_patch(url: &str) -> RecordPatch {
        RecordPatch {
            etag: Some("\"v1\"".into()),
            content_hash: Some("abc123".into()),
            body_ref: Some("abc123".into()),
            last_checked_at: Some(Utc::now()),
            indexed: Some(true),
            ..RecordPatch::new(url, "docs")
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = store().await;
        store.upsert_record(indexed_patch("https://docs.example/a")).await.unwrap();

        let record = store.get_record("https://docs.example/a").await.unwrap().unwrap();
        assert_eq!(record.source, "docs");
        assert_eq!(record.etag.as_deref(), Some("\"v1\""));
        assert!(record.indexed);
        assert_eq!(record.content_hash.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = store().await;
        assert!(store.get_record("https://docs.example/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_preserves_unset_fields() {
        let store = store().await;
        store.upsert_record(indexed_patch("https://docs.example/a")).await.unwrap();

        // A staleness-check-only patch must not clear validators or the
        // indexed flag.
        let touch = RecordPatch {
            last_checked_at: Some(Utc::now()),
            ..RecordPatch::new("https://docs.example/a", "docs")
        };
        store.upsert_record(touch).await.unwrap();

        let record = store.get_record("https://docs.example/a").await.unwrap().unwrap();
        assert_eq!(record.etag.as_deref(), Some("\"v1\""));
        assert_eq!(record.content_hash.as_deref(), Some("abc123"));
        assert!(record.indexed);
        assert!(record.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_updated_at_refreshes_created_at_does_not() {
        let store = store().await;
        store.upsert_record(RecordPatch::new("https://docs.example/a", "docs")).await.unwrap();
        let before = store.get_record("https://docs.example/a").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.upsert_record(indexed_patch("https://docs.example/a")).await.unwrap();
        let after = store.get_record("https://docs.example/a").await.unwrap().unwrap();

        assert_eq!(before.created_at, after.created_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn test_indexed_without_hash_rejected() {
        let store = store().await;
        let patch = RecordPatch { indexed: Some(true), ..RecordPatch::new("https://docs.example/a", "docs") };
        assert!(store.upsert_record(patch).await.is_err());
        assert!(store.get_record("https://docs.example/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_without_body_rejected() {
        let store = store().await;
        let patch = RecordPatch {
            content_hash: Some("abc123".into()),
            ..RecordPatch::new("https://docs.example/a", "docs")
        };
        assert!(store.upsert_record(patch).await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_upsert_all_or_nothing() {
        let store = store().await;
        let good = RecordPatch::new("https://docs.example/ok", "docs");
        // Violates the indexed-requires-hash constraint.
        let bad = RecordPatch { indexed: Some(true), ..RecordPatch::new("https://docs.example/bad", "docs") };

        assert!(store.bulk_upsert_records(vec![good, bad]).await.is_err());
        assert!(store.get_record("https://docs.example/ok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_upsert_commits_batch() {
        let store = store().await;
        let patches: Vec<_> = (0..5)
            .map(|i| RecordPatch::new(format!("https://docs.example/{i}"), "docs"))
            .collect();
        store.bulk_upsert_records(patches).await.unwrap();

        let all = store.query_records(RecordQuery::default()).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_query_filters_combine() {
        let store = store().await;
        store.upsert_record(indexed_patch("https://docs.example/a")).await.unwrap();
        store.upsert_record(RecordPatch::new("https://docs.example/b", "docs")).await.unwrap();
        store.upsert_record(RecordPatch::new("https://blog.example/c", "blog")).await.unwrap();

        let docs = store
            .query_records(RecordQuery { source: Some("docs".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);

        let docs_indexed = store
            .query_records(RecordQuery {
                source: Some("docs".into()),
                indexed: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(docs_indexed.len(), 1);
        assert_eq!(docs_indexed[0].url, "https://docs.example/a");

        let none = store
            .query_records(RecordQuery {
                updated_before: Some(Utc::now() - chrono::Duration::days(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_by_source() {
        let store = store().await;
        store.upsert_record(indexed_patch("https://docs.example/a")).await.unwrap();
        store.upsert_record(RecordPatch::new("https://docs.example/b", "docs")).await.unwrap();
        store.upsert_record(RecordPatch::new("https://blog.example/c", "blog")).await.unwrap();

        let stats = store.aggregate_by_source().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].source, "blog");
        assert_eq!(stats[0].total, 1);
        assert_eq!(stats[0].indexed_count, 0);
        assert_eq!(stats[1].source, "docs");
        assert_eq!(stats[1].total, 2);
        assert_eq!(stats[1].indexed_count, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_patch() -> impl Strategy<Value = RecordPatch> {
            (
                0u8..3,
                proptest::option::of("[a-z]{4}"),
                proptest::option::of("[a-f0-9]{8}"),
                any::<bool>(),
                proptest::option::of(any::<bool>()),
            )
                .prop_map(|(slot, etag, hash, with_body, indexed)| RecordPatch {
                    etag,
                    body_ref: if with_body { hash.clone() } else { None },
                    content_hash: hash,
                    indexed,
                    ..RecordPatch::new(format!("https://docs.example/{slot}"), "docs")
                })
        }

        proptest! {
            // Whatever sequence of merges is applied, and whichever of them
            // the store rejects, no surviving row may claim to be indexed
            // without its hash and stored body.
            #[test]
            fn prop_indexed_implies_hash_and_body(patches in proptest::collection::vec(arb_patch(), 1..24)) {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
                rt.block_on(async move {
                    let store = SqliteStore::open_in_memory().await.unwrap();
                    for patch in patches {
                        let _ = store.upsert_record(patch).await;
                    }
                    let all = store.query_records(RecordQuery::default()).await.unwrap();
                    for record in all {
                        if record.indexed {
                            prop_assert!(record.content_hash.is_some());
                        }
                        if record.content_hash.is_some() {
                            prop_assert!(record.body_ref.is_some());
                        }
                    }
                    Ok(())
                })?;
            }
        }
    }
}
