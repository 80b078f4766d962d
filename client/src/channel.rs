//! The channel capability the objects runtime is built on.
//!
//! Transport, attach lifecycle and authentication live outside this crate. The
//! runtime only needs to publish operation messages, observe attachment state
//! and ask for the server's clock.

use std::fmt;

use async_trait::async_trait;
use converge_engine::{OutboundObjectMessage, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Attachment state of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detached,
    Failed,
    Suspended,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::Attaching => "attaching",
            AttachmentState::Attached => "attached",
            AttachmentState::Detached => "detached",
            AttachmentState::Failed => "failed",
            AttachmentState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by the channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChannelError {
    /// Transport-specific error code, if any
    pub code: Option<u32>,
    pub message: String,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }
}

/// A realtime channel that carries object messages.
#[async_trait]
pub trait CoreChannel: Send + Sync {
    /// Send messages as one wire message.
    async fn publish(&self, messages: Vec<OutboundObjectMessage>) -> Result<(), ChannelError>;

    /// Observe attachment state transitions.
    fn watch_state(&self) -> watch::Receiver<AttachmentState>;

    /// The current attachment state.
    fn state(&self) -> AttachmentState {
        let state = *self.watch_state().borrow();
        state
    }

    /// Server time in milliseconds since the Unix epoch.
    async fn fetch_server_time(&self) -> Result<Timestamp, ChannelError>;

    /// Ask the server for a fresh object sync after a sync was abandoned.
    async fn request_resync(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
