use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not running")]
    NotRunning,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation not supported by this channel: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;
