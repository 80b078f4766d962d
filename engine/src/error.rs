//! Error types for the Converge engine.

use crate::{ObjectId, ObjectKind};
use thiserror::Error;

/// All possible errors from the Converge engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Wire errors
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid sync cursor: {0:?}")]
    InvalidSyncCursor(String),

    // Operation errors
    #[error("duplicate operation {serial} on object {object_id}")]
    DuplicateOperation { object_id: ObjectId, serial: String },

    #[error("invalid counter amount (must be a finite number): {0}")]
    InvalidCounterAmount(f64),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    // Pool errors
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    #[error("object {object_id} is not a {expected}")]
    WrongObjectKind {
        object_id: ObjectId,
        expected: ObjectKind,
    },
}

impl Error {
    /// Whether the error invalidates a whole sync sequence rather than a
    /// single operation.
    pub fn is_sync_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::InvalidSyncCursor(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
