//! Binary protocol for document channels and the relay server.
//!
//! Channel message (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬──────────┐
//! │ kind     │ user_id   │ epoch     │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! `payload` is a bincode-encoded [`Edit`] for `ContentUpdate` and a
//! [`CursorPosition`] for `CursorUpdate`. `seq` is assigned per sender and
//! increases by one for every message that sender publishes. `epoch`
//! names the sender instance: a user who reopens a document gets a new
//! epoch and starts counting from 1 again.
//!
//! The relay server wraps channel messages in [`ClientFrame`] /
//! [`ServerFrame`], carried as binary WebSocket frames.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::CursorPosition;
use crate::model::{DocumentId, Edit, UserId};
use crate::presence::PresenceEntry;

/// Event kinds carried on a document's broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    /// Whole-content change, payload is an `Edit`
    ContentUpdate = 1,
    /// Cursor / selection move, payload is a `CursorPosition`
    CursorUpdate = 2,
}

impl EventKind {
    /// Event name as used on the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContentUpdate => "content_update",
            EventKind::CursorUpdate => "cursor_update",
        }
    }
}

/// One message on a document's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub kind: EventKind,
    pub user_id: UserId,
    /// Sender instance that `seq` counts within
    pub epoch: Uuid,
    /// Per-sender sequence number
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// Create a content update carrying `edit`.
    pub fn content_update(user_id: UserId, seq: u64, edit: &Edit) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EventKind::ContentUpdate,
            user_id,
            epoch: Uuid::nil(),
            seq,
            payload: encode(edit)?,
        })
    }

    /// Create a cursor update carrying `cursor`.
    pub fn cursor_update(
        user_id: UserId,
        seq: u64,
        cursor: &CursorPosition,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: EventKind::CursorUpdate,
            user_id,
            epoch: Uuid::nil(),
            seq,
            payload: encode(cursor)?,
        })
    }

    /// Stamp the sender instance. Messages built without one carry the
    /// nil epoch.
    pub fn with_epoch(mut self, epoch: Uuid) -> Self {
        self.epoch = epoch;
        self
    }

    /// Decode the payload of a content update.
    pub fn edit(&self) -> Result<Edit, ProtocolError> {
        self.expect_kind(EventKind::ContentUpdate)?;
        decode(&self.payload)
    }

    /// Decode the payload of a cursor update.
    pub fn cursor(&self) -> Result<CursorPosition, ProtocolError> {
        self.expect_kind(EventKind::CursorUpdate)?;
        decode(&self.payload)
    }

    fn expect_kind(&self, expected: EventKind) -> Result<(), ProtocolError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.kind,
            })
        }
    }

    /// Encode to binary (bincode).
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Decode from binary.
    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay frames
// ───────────────────────────────────────────────────────────────────

/// Frames sent by a client to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, message: ChannelMessage },
    /// Register presence; the server answers every room member with a sync.
    Join { document_id: DocumentId, entry: PresenceEntry },
    Leave { document_id: DocumentId, user_id: UserId },
    Heartbeat { document_id: DocumentId, user_id: UserId },
    Ping,
}

/// Frames pushed by the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Message { channel: String, message: ChannelMessage },
    /// Full membership of a document's presence room.
    PresenceSync { document_id: DocumentId, entries: Vec<PresenceEntry> },
    Pong,
    Error { reason: String },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// bincode (standard config) encode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

/// bincode (standard config) decode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol-level errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {found:?}")]
    InvalidMessageType { expected: EventKind, found: EventKind },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Selection;
    use crate::model::EditId;
    use crate::presence::CursorColor;

    #[test]
    fn test_content_update_payload() {
        let user = UserId::new();
        let edit = Edit::replace(EditId(4), user, "Hello World");
        let msg = ChannelMessage::content_update(user, 9, &edit).unwrap();

        let decoded = ChannelMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind.as_str(), "content_update");
        assert_eq!(decoded.seq, 9);
        assert_eq!(decoded.edit().unwrap(), edit);
    }

    #[test]
    fn test_wrong_payload_kind_rejected() {
        let user = UserId::new();
        let cursor = CursorPosition {
            user_id: user,
            display_name: "Ana".into(),
            position: 3,
            selection: Some(Selection { start: 1, end: 3 }),
            color: CursorColor::from_user(user),
        };
        let msg = ChannelMessage::cursor_update(user, 1, &cursor).unwrap();

        assert_eq!(
            msg.edit(),
            Err(ProtocolError::InvalidMessageType {
                expected: EventKind::ContentUpdate,
                found: EventKind::CursorUpdate,
            })
        );
        assert_eq!(msg.cursor().unwrap(), cursor);
    }

    #[test]
    fn test_garbage_frame() {
        assert!(matches!(
            ClientFrame::decode(&[0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_publish_frame() {
        let user = UserId::new();
        let edit = Edit::replace(EditId(1), user, "x");
        let frame = ClientFrame::Publish {
            channel: DocumentId::new().broadcast_channel(),
            message: ChannelMessage::content_update(user, 1, &edit).unwrap(),
        };
        assert_eq!(ClientFrame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }
}
