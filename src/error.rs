use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The request never produced a response (connect failure, reset, timeout).
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Rate limited by server (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("Local store error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Transport failures are retried on the next trigger; everything else
    /// aborts the current cycle.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        SyncError::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::Network(err.to_string())
        } else if err.is_decode() {
            SyncError::InvalidRecord(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::http(status.as_u16(), err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
