//! Error taxonomy for the pipeline.
//!
//! Per-entry problems (a malformed row, an unparseable distance) are skipped
//! and counted where they occur; only the variants here cross module
//! boundaries.

use thiserror::Error;

/// Fatal extraction failure: the page or session is gone, the pass aborts.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("course records table not found on page (layout change or logged out?)")]
    TableMissing,
    #[error("page session lost: {0}")]
    SessionLost(String),
}

/// A single raw entry that could not be normalized. Logged and skipped.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("missing segment link")]
    MissingLink,
    #[error("no segment id in link '{0}'")]
    BadSegmentId(String),
    #[error("empty segment name")]
    EmptyName,
    #[error("unparseable distance '{0}'")]
    BadDistance(String),
    #[error("unparseable elevation '{0}'")]
    BadElevation(String),
    #[error("unparseable date '{0}'")]
    BadDate(String),
}

/// Classified outcome of one enrichment call (after retries, for the
/// transient class).
#[derive(Debug, Error)]
pub enum EnrichError {
    /// 429 or 5xx or a network-level failure; retried with backoff before
    /// being surfaced.
    #[error("transient API failure: {0}")]
    Transient(String),
    /// 404 and friends: the segment is deleted or private. Never retried.
    #[error("segment permanently unavailable: HTTP {0}")]
    Permanent(u16),
    /// 401/403: the bearer token is bad for every remaining call, not just
    /// this one. Halts the enrichment phase.
    #[error("credential rejected: HTTP {0}")]
    Credential(u16),
    /// The rate limiter could not hand out a token within its bounded wait.
    #[error("timed out waiting for a rate limit token")]
    LimiterTimeout,
    #[error("unexpected response shape: {0}")]
    BadResponse(String),
}

impl EnrichError {
    /// Whether another attempt against the same segment can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EnrichError::Transient(_) | EnrichError::LimiterTimeout)
    }

    /// Whether this failure poisons every subsequent call.
    pub fn is_fatal_to_phase(&self) -> bool {
        matches!(self, EnrichError::Credential(_))
    }
}
