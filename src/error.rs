use thiserror::Error;

/// Errors surfaced by the tracker directory, the chunk store and the
/// publication / retrieval flows.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Every known holder of the chunk failed to serve it.
    #[error("chunk {0} unavailable from every known holder")]
    ChunkUnavailable(u32),

    /// The directory response lacks entries for these chunk indices.
    #[error("directory response is missing chunk indices {0:?}")]
    IncompleteDirectory(Vec<u32>),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl SwarmError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        SwarmError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SwarmError::NotFound(msg.into())
    }
}

impl From<reqwest::Error> for SwarmError {
    fn from(e: reqwest::Error) -> Self {
        SwarmError::TransientNetwork(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
