//! Incremental indexing pipeline for quarry.
//!
//! This crate provides:
//! - Change detection over cached validators and content hashes
//! - Text chunking, the embedding client, and the chunk vector sink
//! - The orchestrator driving lease-guarded indexing runs

pub mod chunk;
pub mod detect;
pub mod embed;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod vector;

pub use chunk::Chunker;
pub use detect::{ChangeDetector, Detection};
pub use embed::{EmbeddingClient, HttpEmbeddingClient};
pub use orchestrator::{CancelFlag, Indexer, RunOptions};
pub use report::{ResourceError, RunReport};
pub use retry::{RetryPolicy, with_backoff};
pub use vector::{ChunkContext, SqliteVectorSink, VectorSink};
