//! Error types for uridx-core.
//!
//! Not-found is never an error: lookups return `Ok(None)` / `Ok(false)` and
//! the tool facade reports `status: "not_found"`.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, UridxError>;

/// Library error kinds.
#[derive(Debug, Error)]
pub enum UridxError {
    /// Fatal configuration problem: missing or inconsistent embedding
    /// dimension, unreachable embedding service at first bootstrap.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid ingestion input (missing source_uri, malformed record).
    /// Skipped with a warning during batch ingestion.
    #[error("invalid input: {0}")]
    Input(String),

    /// Embedding service failure that survived retries. Aborts the
    /// containing ingestion only; nothing is committed.
    #[error("embedding service error: {0}")]
    Transient(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UridxError {
    /// Whether this error should terminate the process (exit code 1)
    /// rather than skip the current record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
