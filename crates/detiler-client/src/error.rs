use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure, timeout, or a 5xx answer. The only retryable class.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Upstream(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
