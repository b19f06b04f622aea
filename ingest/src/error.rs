use thiserror::Error;

/// Failures that abort a run. Everything per-record is absorbed by the
/// pipeline and shows up in the report instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("failed to fetch play history: {0}")]
    Fetch(String),

    #[error("database connection failed: {0}")]
    Connection(#[source] StoreError),

    #[error("database schema error: {0}")]
    Schema(String),
}

impl IngestError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            IngestError::Config(_) => 1,
            IngestError::Authentication(_) => 2,
            IngestError::Fetch(_) => 3,
            IngestError::Connection(_) => 4,
            IngestError::Schema(_) => 5,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        IngestError::Fetch(e.to_string())
    }
}

/// A single history item that could not be turned into a `PlayRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record (played_at: {}): {reason}", .played_at.as_deref().unwrap_or("<missing>"))]
pub struct MalformedRecord {
    pub played_at: Option<String>,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(played_at: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            played_at: played_at.map(String::from),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Rejected(String),
}
