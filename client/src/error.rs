//! Unified error handling for the client.

use crate::channel::{AttachmentState, ChannelError};
use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Cannot {operation}: channel is {state}")]
    NotAttached {
        operation: &'static str,
        state: AttachmentState,
    },

    #[error("Publish failed: {0}")]
    PublishFailed(ChannelError),

    #[error("Engine error: {0}")]
    Engine(#[from] converge_engine::Error),

    #[error("Failed to fetch server time: {0}")]
    ServerTime(ChannelError),

    #[error("Objects runtime has shut down")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether re-issuing the same logical write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PublishFailed(_) | Error::NotAttached { .. } | Error::ServerTime(_)
        )
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
