//! Web client for quarry.
//!
//! This crate provides the HTTP fetch pipeline with conditional-request
//! support, candidate discovery from sitemaps, and DOM text extraction
//! used by the indexer.

pub mod discover;
pub mod extract;
pub mod fetch;

pub use discover::{Candidate, Discovery, SitemapDiscovery};

pub use extract::{DomExtractor, Extraction, Extractor};

pub use fetch::{
    FetchClient, FetchConfig, FetchOutcome, FetchResponse, Fetcher, Validators, canonical_key,
    canonicalize,
};
