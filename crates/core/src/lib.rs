//! Core types and shared functionality for quarry.
//!
//! This crate provides:
//! - The metadata store (records, bodies, leases) with SQLite backend
//! - Unified error types
//! - Layered application configuration

pub mod config;
pub mod error;
pub mod store;

pub use config::{AppConfig, ConfigError, SourceSpec};
pub use error::Error;
pub use store::{CacheRecord, LeaseGrant, MetadataStore, RecordPatch, RecordQuery, SqliteStore};
