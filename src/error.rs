use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the k-line cache pipeline.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A fetched row failed field validation. The whole page is rejected.
    #[error("Invalid kline data at index {index}: {reason}")]
    InvalidData { index: usize, reason: String },

    /// Network or API failure, including an empty body after all retries.
    #[error("Failed to fetch kline data: {0}")]
    FetchFailed(String),

    /// The stored series could not be parsed.
    #[error("Corrupt cache file {path:?}: {source}")]
    CorruptCache {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown interval: {0}")]
    UnknownInterval(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch cancelled")]
    Cancelled,
}
