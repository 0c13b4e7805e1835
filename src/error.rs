use thiserror::Error;

use crate::record::Dataset;

/// Per-URL fetch failure. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("timed out")]
    Timeout,

    #[error("page not found")]
    NotFound,

    #[error("network error: {0}")]
    Network(String),
}

impl FetchError {
    /// Worth another attempt under a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout | FetchError::Network(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            FetchError::NotFound
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// A page that produced no keepable record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionMiss {
    #[error("no name on page")]
    NoName,

    #[error("unparseable page: {0}")]
    Unparseable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// No store exists yet at the locator. Callers start from an empty dataset.
    #[error("no record store at {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("schema mismatch: {0}")]
    Schema(String),
}

/// Store-level failures that unwind a whole run.
#[derive(Debug, Error)]
pub enum RunAborted {
    #[error("could not load record store: {0}")]
    Load(#[source] StoreError),

    /// The final dataset is handed back so the caller can still save it.
    #[error("could not persist {} records: {source}", .dataset.len())]
    Persist {
        #[source]
        source: StoreError,
        dataset: Dataset,
    },
}
