//! Error type surfaced by the synchronization core.

use std::time::Duration;

use crate::model::{DocumentId, EditId, UserId};
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors returned by synchronizer, lock, session and service operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollabError {
    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store rejected a write whose version was not `current + 1`.
    #[error("Version conflict: store holds {current}, write carried {attempted}")]
    VersionConflict { current: u64, attempted: u64 },

    #[error("Document {document_id} is already locked by {holder}")]
    AlreadyLocked { document_id: DocumentId, holder: UserId },

    #[error("Channel disconnected: {0}")]
    ChannelDisconnected(String),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("No document loaded")]
    NotLoaded,

    #[error("No pending edit {0}")]
    UnknownEdit(EditId),

    #[error("Store request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl CollabError {
    /// Stable machine-readable code, used in relay error frames and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CollabError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CollabError::VersionConflict { .. } => "VERSION_CONFLICT",
            CollabError::AlreadyLocked { .. } => "ALREADY_LOCKED",
            CollabError::ChannelDisconnected(_) => "CHANNEL_DISCONNECTED",
            CollabError::NotFound(_) => "NOT_FOUND",
            CollabError::AlreadyExists(_) => "ALREADY_EXISTS",
            CollabError::NotLoaded => "NOT_LOADED",
            CollabError::UnknownEdit(_) => "UNKNOWN_EDIT",
            CollabError::Timeout(_) => "TIMEOUT",
            CollabError::Protocol(_) => "PROTOCOL",
        }
    }

    /// True for failures of a store write that must roll local state back.
    pub fn is_write_failure(&self) -> bool {
        matches!(
            self,
            CollabError::StoreUnavailable(_)
                | CollabError::VersionConflict { .. }
                | CollabError::Timeout(_)
                | CollabError::NotFound(_)
        )
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CollabError::NotFound(id),
            StoreError::AlreadyExists(id) => CollabError::AlreadyExists(id),
            StoreError::VersionConflict { current, attempted } => {
                CollabError::VersionConflict { current, attempted }
            }
            StoreError::Locked { document_id, holder } => {
                CollabError::AlreadyLocked { document_id, holder }
            }
            other => CollabError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;
