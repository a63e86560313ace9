//! Core data model shared by every layer of the sync core.
//!
//! ```text
//! CollaborativeDocument ── owned by the store, cached per client
//!        │
//!        ├── Edit         (Replace is durable; Insert/Delete are local transforms)
//!        ├── PendingEdit  (edit + pre-edit snapshot, lives until commit/rollback)
//!        └── HistoryEntry (snapshot appended after each commit)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identifiers
// ───────────────────────────────────────────────────────────────────

/// Stable identifier of a shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the broadcast channel carrying content and cursor traffic.
    pub fn broadcast_channel(&self) -> String {
        format!("document:{}", self.0)
    }

    /// Name of the presence channel carrying membership syncs.
    pub fn presence_channel(&self) -> String {
        format!("presence:{}", self.0)
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a collaborating user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-client edit sequence number. Doubles as the commit sequence used to
/// recognise stale store responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EditId(pub u64);

impl fmt::Display for EditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current time truncated to whole milliseconds, the precision timestamps
/// keep on the wire and on disk.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ───────────────────────────────────────────────────────────────────
// Documents
// ───────────────────────────────────────────────────────────────────

/// A shared text document as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborativeDocument {
    pub id: DocumentId,
    pub content: String,
    /// Incremented by exactly one per committed write.
    pub version: u64,
    pub last_edited_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_edited_at: DateTime<Utc>,
    pub locked_by: Option<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub locked_at: Option<DateTime<Utc>>,
}

impl CollaborativeDocument {
    /// A freshly created document. Creation counts as the first write, so
    /// new documents start at version 1.
    pub fn new(id: DocumentId, content: impl Into<String>, author: UserId) -> Self {
        Self {
            id,
            content: content.into(),
            version: 1,
            last_edited_by: author,
            last_edited_at: timestamp_now(),
            locked_by: None,
            locked_at: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Lock view of this row, if a holder is set.
    pub fn lock_info(&self) -> Option<LockInfo> {
        let locked_by = self.locked_by?;
        Some(LockInfo {
            document_id: self.id,
            locked_by,
            locked_at: self.locked_at.unwrap_or(self.last_edited_at),
        })
    }
}

/// Conditional write payload. The store accepts it only when `version` is
/// exactly one past the stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub content: String,
    pub version: u64,
    pub last_edited_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_edited_at: DateTime<Utc>,
}

/// Snapshot recorded after a committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: String,
    pub edited_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub edited_at: DateTime<Utc>,
}

impl From<&CollaborativeDocument> for HistoryEntry {
    fn from(document: &CollaborativeDocument) -> Self {
        Self {
            document_id: document.id,
            version: document.version,
            content: document.content.clone(),
            edited_by: document.last_edited_by,
            edited_at: document.last_edited_at,
        }
    }
}

/// Advisory lock holder of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub document_id: DocumentId,
    pub locked_by: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub locked_at: DateTime<Utc>,
}

// ───────────────────────────────────────────────────────────────────
// Edits
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Insert,
    Delete,
    Replace,
}

/// A single change to a document's content.
///
/// `position` is a character offset. For `Delete`, the number of removed
/// characters is the char count of `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub id: EditId,
    pub user_id: UserId,
    pub kind: EditKind,
    pub position: usize,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Edit {
    pub fn replace(id: EditId, user_id: UserId, content: impl Into<String>) -> Self {
        Self::new(id, user_id, EditKind::Replace, 0, content)
    }

    pub fn insert(id: EditId, user_id: UserId, position: usize, content: impl Into<String>) -> Self {
        Self::new(id, user_id, EditKind::Insert, position, content)
    }

    pub fn delete(id: EditId, user_id: UserId, position: usize, removed: impl Into<String>) -> Self {
        Self::new(id, user_id, EditKind::Delete, position, removed)
    }

    fn new(
        id: EditId,
        user_id: UserId,
        kind: EditKind,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            kind,
            position,
            content: content.into(),
            timestamp: timestamp_now(),
        }
    }

    /// Apply this edit to `content`, returning the new text.
    ///
    /// Offsets past the end of the text are clamped to its length.
    pub fn apply_to(&self, content: &str) -> String {
        match self.kind {
            EditKind::Replace => self.content.clone(),
            EditKind::Insert => {
                let at = byte_offset(content, self.position);
                let mut out = String::with_capacity(content.len() + self.content.len());
                out.push_str(&content[..at]);
                out.push_str(&self.content);
                out.push_str(&content[at..]);
                out
            }
            EditKind::Delete => {
                let start = byte_offset(content, self.position);
                let removed = self.content.chars().count();
                let end = byte_offset(content, self.position.saturating_add(removed));
                let mut out = String::with_capacity(content.len());
                out.push_str(&content[..start]);
                out.push_str(&content[end..]);
                out
            }
        }
    }
}

/// Byte index of the `chars`-th character, or the string length.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}

/// An edit that has been issued but not yet acknowledged by the store,
/// together with the local state it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEdit {
    pub edit: Edit,
    pub previous_content: String,
    pub previous_version: u64,
    pub previous_edited_by: UserId,
    pub previous_edited_at: DateTime<Utc>,
    /// Whether the edit was applied to local state before the write.
    pub optimistic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_splices_at_char_offset() {
        let user = UserId::new();
        let edit = Edit::insert(EditId(1), user, 5, ",");
        assert_eq!(edit.apply_to("Hello World"), "Hello, World");
    }

    #[test]
    fn test_insert_past_end_is_clamped() {
        let edit = Edit::insert(EditId(1), UserId::new(), 100, "!");
        assert_eq!(edit.apply_to("Hi"), "Hi!");
    }

    #[test]
    fn test_delete_counts_characters_not_bytes() {
        let edit = Edit::delete(EditId(1), UserId::new(), 1, "éè");
        assert_eq!(edit.apply_to("aéèb"), "ab");
    }

    #[test]
    fn test_delete_past_end_truncates() {
        let edit = Edit::delete(EditId(1), UserId::new(), 3, "xxxxxx");
        assert_eq!(edit.apply_to("Hello"), "Hel");
    }

    #[test]
    fn test_replace_substitutes_everything() {
        let edit = Edit::replace(EditId(7), UserId::new(), "v2");
        assert_eq!(edit.apply_to("v1"), "v2");
    }

    #[test]
    fn test_new_document_starts_at_version_one() {
        let author = UserId::new();
        let doc = CollaborativeDocument::new(DocumentId::new(), "Hello", author);
        assert_eq!(doc.version, 1);
        assert_eq!(doc.last_edited_by, author);
        assert!(!doc.is_locked());
        assert!(doc.lock_info().is_none());
    }

    #[test]
    fn test_channel_names() {
        let id = DocumentId::new();
        assert_eq!(id.broadcast_channel(), format!("document:{}", id.0));
        assert_eq!(id.presence_channel(), format!("presence:{}", id.0));
    }
}
