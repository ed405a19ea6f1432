use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("storage error: {0}")]
    Storage(#[from] minder_storage::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
