use std::time::Duration;

use catalog_sdk::ApiError;
use live_channel::ChannelError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ViewError {
    /// Fetch or channel failure. Previously loaded data stays visible.
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// A response from a superseded generation. Never surfaced to the UI.
    #[error("stale response for generation {received} (current {current})")]
    StaleResponse { received: u64, current: u64 },
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A request above a configured bound; rejected before any mutation.
    #[error("{what} of {requested} exceeds limit {limit}")]
    Capacity {
        what: &'static str,
        requested: u64,
        limit: u64,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ViewError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ViewError::Network { retryable, .. } => *retryable,
            ViewError::Timeout(_) => true,
            ViewError::StaleResponse { .. }
            | ViewError::Protocol(_)
            | ViewError::Capacity { .. }
            | ViewError::Config(_) => false,
        }
    }
}

impl From<ApiError> for ViewError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Timeout(limit) => ViewError::Timeout(limit),
            other => ViewError::Network {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ChannelError> for ViewError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Protocol { .. } => ViewError::Protocol(err.to_string()),
            ChannelError::Timeout(limit) => ViewError::Timeout(limit),
            other => ViewError::Network {
                message: other.to_string(),
                retryable: true,
            },
        }
    }
}

pub type ViewResult<T> = Result<T, ViewError>;
