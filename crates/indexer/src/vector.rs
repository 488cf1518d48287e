//! Chunk vector storage.
//!
//! Embedded chunks land in the `chunks` table of the same SQLite file as the
//! metadata store. A resource's rows are replaced wholesale inside one
//! transaction on re-index, so readers never observe a mix of old and new
//! chunks for the same URL.

use async_trait::async_trait;
use tokio_rusqlite::{Connection, params};

use quarry_core::store::content_hash;
use quarry_core::{Error, SqliteStore};

/// Per-resource metadata written alongside every chunk row.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub source: String,
    pub title: Option<String>,
    /// Model that produced the vectors; mixing models in one index makes
    /// their distances meaningless.
    pub model: String,
}

/// Destination for embedded chunks.
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Replace the stored chunks for a resource. `chunks` and `vectors`
    /// correspond by index.
    async fn store(
        &self,
        url: &str,
        chunks: Vec<String>,
        vectors: Vec<Vec<f32>>,
        ctx: ChunkContext,
    ) -> Result<(), Error>;

    /// Drop all chunks for a resource, returning how many were removed.
    async fn remove(&self, url: &str) -> Result<u64, Error>;

    /// Number of stored chunks for a resource.
    async fn count_for(&self, url: &str) -> Result<u64, Error>;
}

/// Stable chunk row id: a short digest of the URL plus the chunk index, so
/// re-indexing a resource rewrites the same ids.
fn chunk_id(url: &str, index: usize) -> String {
    format!("{}:{:04}", &content_hash(url.as_bytes())[..16], index)
}

/// Vectors are stored as little-endian f32 BLOBs.
fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Sink writing into the metadata store's SQLite file.
#[derive(Clone)]
pub struct SqliteVectorSink {
    conn: Connection,
}

impl SqliteVectorSink {
    /// Share the store's connection handle; chunk writes and record writes
    /// go through the same file.
    pub fn new(store: &SqliteStore) -> Self {
        Self { conn: store.connection() }
    }
}

#[async_trait]
impl VectorSink for SqliteVectorSink {
    async fn store(
        &self,
        url: &str,
        chunks: Vec<String>,
        vectors: Vec<Vec<f32>>,
        ctx: ChunkContext,
    ) -> Result<(), Error> {
        if chunks.len() != vectors.len() {
            return Err(Error::InvalidInput(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }

        let url = url.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM chunks WHERE url = ?1", params![url])?;
                for (index, (content, vector)) in chunks.iter().zip(&vectors).enumerate() {
                    tx.execute(
                        "INSERT INTO chunks (id, url, source, title, chunk_index, content, embedding, model, indexed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            chunk_id(&url, index),
                            url,
                            ctx.source,
                            ctx.title,
                            index as i64,
                            content,
                            encode_embedding(vector),
                            ctx.model,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn remove(&self, url: &str) -> Result<u64, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM chunks WHERE url = ?1", params![url])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    async fn count_for(&self, url: &str) -> Result<u64, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE url = ?1",
                    params![url],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
