/// Errors returned by [`crate::Sink`] implementations.
///
/// # Examples
///
/// ```rust
/// use perfmon_storage::SinkError;
///
/// let err = SinkError::PartitionNotFound("2024-01-01".to_string());
/// assert!(err.to_string().contains("2024-01-01"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink: partition {0} not found")]
    PartitionNotFound(String),

    #[error("Sink: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Sink: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sink: HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A stored value could not be mapped back to the data model.
    #[error("Sink: corrupt value in column '{column}': {detail}")]
    Corrupt { column: &'static str, detail: String },

    /// The blocking worker running the write panicked or was cancelled.
    #[error("Sink: worker task failed: {0}")]
    Worker(String),

    /// The backend refused the write (also used by the in-memory test sink).
    #[error("Sink: unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;
