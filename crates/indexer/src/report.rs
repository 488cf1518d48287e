//! Run reporting.

use quarry_core::Error;
use serde::Serialize;

/// One resource that could not be brought up to date during a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceError {
    pub url: String,
    pub message: String,
}

/// Outcome summary of one indexing run over a source.
///
/// A run is successful when every candidate was either indexed or
/// legitimately skipped; any per-resource error makes the run as a whole
/// unsuccessful while still reporting the work that did complete.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub success: bool,
    pub indexed_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<ResourceError>,
}

impl RunReport {
    pub fn record_indexed(&mut self) {
        self.indexed_count += 1;
    }

    pub fn record_skipped(&mut self) {
        self.skipped_count += 1;
    }

    pub fn record_error(&mut self, url: impl Into<String>, err: &Error) {
        self.errors.push(ResourceError { url: url.into(), message: err.to_string() });
    }

    /// Set the final success flag from the collected errors.
    pub fn finish(mut self) -> Self {
        self.success = self.errors.is_empty();
        self
    }
}
