//! Content-addressed body storage.
//!
//! Fetched bodies are stored once per distinct content, keyed by their
//! SHA-256 digest. `CacheRecord.body_ref` holds the digest, so a record can
//! always get back to the exact bytes its `content_hash` was computed from,
//! and the change detector can reuse a cached body when the network is flaky.

use super::connection::SqliteStore;
use crate::Error;
use sha2::{Digest, Sha256};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// SHA-256 digest of a body, hex-encoded. Used both as the content hash
/// compared during change detection and as the body storage key.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl SqliteStore {
    /// Store a body, returning its reference key.
    ///
    /// Identical content is stored once; re-saving the same bytes is a
    /// no-op returning the same reference.
    pub async fn save_body(&self, bytes: &[u8]) -> Result<String, Error> {
        let hash = content_hash(bytes);
        let key = hash.clone();
        let content = bytes.to_vec();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO bodies (hash, content, stored_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(hash) DO NOTHING",
                    params![key, content, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;
        Ok(hash)
    }

    /// Load a body by reference. Returns None if the reference is unknown.
    pub async fn load_body(&self, body_ref: &str) -> Result<Option<Vec<u8>>, Error> {
        let body_ref = body_ref.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Vec<u8>>, Error> {
                let result =
                    conn.query_row("SELECT content FROM bodies WHERE hash = ?1", params![body_ref], |row| {
                        row.get(0)
                    });
                match result {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Delete bodies no record references anymore.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_orphan_bodies(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM bodies WHERE hash NOT IN (
                        SELECT body_ref FROM records WHERE body_ref IS NOT NULL
                    )",
                    [],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
