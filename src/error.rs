//! Error taxonomy for the collection pipeline.
//!
//! Errors are split by blast radius:
//!
//! | Type | Raised by | Effect on the run |
//! |------|-----------|-------------------|
//! | [`FetchError::RenderTimeout`], [`FetchError::RenderError`] | discovery | fatal, the run ends in `Failed` |
//! | [`FetchError::HttpError`], [`FetchError::Transport`], [`FetchError::DecodeError`] | enrichment | per title, retried or skipped |
//! | [`StoreError::DuplicateSnapshot`] | persistence | benign on re-runs, logged |
//! | [`StoreError::StoreWriteError`] | persistence | per title, logged and skipped |
//!
//! Application plumbing (config, CLI) keeps using `anyhow`.

use std::time::Duration;
use thiserror::Error;

/// Failure of one of the two retrieval modes.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The page did not settle before the wall-clock ceiling.
    #[error("rendering did not complete within {0:?}")]
    RenderTimeout(Duration),

    /// The browser could not be started or crashed mid-render.
    #[error("browser error: {0}")]
    RenderError(String),

    /// Upstream answered with a non-success status code.
    #[error("HTTP {status} from {url}")]
    HttpError { status: u16, url: String },

    /// The request never produced a response (connect, TLS, client timeout).
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    /// The response body was not the JSON we expected.
    #[error("could not decode response: {0}")]
    DecodeError(String),
}

impl FetchError {
    /// Whether a request-mode failure is worth another attempt.
    ///
    /// Rate limiting (429), server errors and transport failures are
    /// transient; any other 4xx and malformed bodies are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpError { status, .. } => *status == 429 || *status >= 500,
            FetchError::Transport { .. } => true,
            _ => false,
        }
    }

    /// Short machine-friendly label used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RenderTimeout(_) => "RenderTimeout",
            FetchError::RenderError(_) => "RenderError",
            FetchError::HttpError { .. } => "HttpError",
            FetchError::Transport { .. } => "Transport",
            FetchError::DecodeError(_) => "DecodeError",
        }
    }
}

/// Per-title enrichment failure.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The body carried `success: false` for this identifier.
    #[error("upstream reported no data for {0}")]
    Rejected(String),

    /// Retries were exhausted; wraps the last error seen.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: FetchError },
}

impl EnrichError {
    pub fn kind(&self) -> &'static str {
        match self {
            EnrichError::Fetch(e) => e.kind(),
            EnrichError::Rejected(_) => "Rejected",
            EnrichError::Exhausted { last, .. } => last.kind(),
        }
    }
}

/// Persistence failure for a single row.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A snapshot for this title already exists for the collection day.
    #[error("snapshot for {identifier} on {day} already recorded")]
    DuplicateSnapshot { identifier: String, day: String },

    #[error("store write failed: {0}")]
    StoreWriteError(#[source] sqlx::Error),

    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A JSON-encoded set column could not be encoded or read back.
    #[error("bad column value: {0}")]
    Column(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::DuplicateSnapshot { .. } => "DuplicateSnapshot",
            StoreError::StoreWriteError(_) | StoreError::Query(_) | StoreError::Column(_) => {
                "StoreWriteError"
            }
        }
    }
}
