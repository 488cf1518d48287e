//! Unified error types for the quarry workspace.
//!
//! Variants are grouped by how the orchestrator reacts to them: store and
//! migration errors abort a run, a held lease returns immediately, and
//! everything else is recorded per resource.

use tokio_rusqlite::rusqlite;

/// Unified error type shared by all quarry crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty HTML).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Durable store operation failed; cache state is unknown.
    #[error("STORE_ERROR: {0}")]
    Store(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Another run holds the lease for this source.
    #[error("LEASE_HELD: '{name}' held by another run, {remaining_secs}s remaining")]
    LeaseHeld { name: String, remaining_secs: u64 },

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Private/internal address not allowed.
    #[error("SSRF_BLOCKED: {0}")]
    SsrfBlocked(String),

    /// Robots.txt disallowed access.
    #[error("ROBOTS_DISALLOWED: {0}")]
    RobotsDisallowed(String),

    /// Request failed at the transport level (connect, reset, DNS).
    #[error("FETCH_FAILED: {0}")]
    FetchFailed(String),

    /// Fetch timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// Non-success HTTP status.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Content extraction failed.
    #[error("EXTRACT_FAILED: {0}")]
    ExtractFailed(String),

    /// Candidate discovery failed and no fallback was available.
    #[error("DISCOVERY_FAILED: {0}")]
    DiscoveryFailed(String),

    /// Embedding service transiently unavailable (retryable).
    #[error("EMBED_UNAVAILABLE: {0}")]
    EmbedUnavailable(String),

    /// Embedding service rejected the request (not retryable).
    #[error("EMBED_REJECTED: {0}")]
    EmbedRejected(String),
}

impl Error {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EmbedUnavailable(_) | Error::FetchFailed(_) | Error::FetchTimeout(_)
        )
    }

    /// Whether this is a transport-level fetch failure, as opposed to a
    /// definitive HTTP response. Drives the assume-unchanged fallback in
    /// change detection.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::FetchFailed(_) | Error::FetchTimeout(_))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Store(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Store(tokio_rusqlite::Error::Close(c)),
            _ => Error::Store(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Store(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(tokio_rusqlite::Error::Error(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::LeaseHeld { name: "docs".to_string(), remaining_secs: 42 };
        assert!(err.to_string().contains("LEASE_HELD"));
        assert!(err.to_string().contains("42s"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::EmbedUnavailable("503".to_string()).is_transient());
        assert!(Error::FetchTimeout("deadline".to_string()).is_transient());
        assert!(!Error::EmbedRejected("bad model".to_string()).is_transient());
        assert!(!Error::HttpError("404".to_string()).is_transient());
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::FetchFailed("connection reset".to_string()).is_transport());
        assert!(Error::FetchTimeout("deadline".to_string()).is_transport());
        assert!(!Error::HttpError("500 Internal Server Error".to_string()).is_transport());
    }

    #[test]
    fn test_rusqlite_error_wraps_as_store() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(err.to_string().contains("STORE_ERROR"));
    }
}
