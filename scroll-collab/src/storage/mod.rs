//! Durable document store.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────┐   get / update (CAS)   ┌──────────────┐
//! │ DocumentSynchronizer │ ─────────────────────► │ DocumentStore│
//! │ DocumentService      │   set_lock / history   │   (trait)    │
//! └──────────────────────┘                        └──────┬───────┘
//!                                                        │
//!                                    ┌───────────────────┴──────────┐
//!                                    ▼                              ▼
//!                             ┌─────────────┐     ┌──────────────────────────────┐
//!                             │ MemoryStore │     │ RocksStore                   │
//!                             │ (HashMap)   │     │ CF "documents": rows (LZ4)   │
//!                             └─────────────┘     │ CF "history": snapshots      │
//!                                                 └──────────────────────────────┘
//! ```
//!
//! Every backend enforces the same write rules, implemented once in
//! `check_update` and `apply_lock`:
//!
//! - an update is accepted iff its version is exactly `stored + 1`;
//! - a lock is granted iff the row is unlocked or already held by the caller.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{CollaborativeDocument, DocumentId, DocumentUpdate, HistoryEntry, UserId};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Document not found: {0}")]
    NotFound(DocumentId),
    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),
    /// Conditional write rejected.
    #[error("Version conflict: store holds {current}, write carried {attempted}")]
    VersionConflict { current: u64, attempted: u64 },
    #[error("Document {document_id} locked by {holder}")]
    Locked { document_id: DocumentId, holder: UserId },
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    /// Backend unreachable (network, shutdown, injected failure)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// The durable home of every collaborative document.
///
/// Implementations must be safe to share between tasks; every method takes
/// `&self`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document by id.
    async fn get(&self, id: DocumentId) -> Result<CollaborativeDocument, StoreError>;

    /// Insert a new document. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, document: CollaborativeDocument) -> Result<CollaborativeDocument, StoreError>;

    /// Conditional write of new content. Returns the stored row.
    async fn update(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Result<CollaborativeDocument, StoreError>;

    /// Set (`Some`) or clear (`None`) the advisory lock.
    async fn set_lock(
        &self,
        id: DocumentId,
        holder: Option<UserId>,
    ) -> Result<CollaborativeDocument, StoreError>;

    /// Record a committed snapshot.
    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError>;

    /// All snapshots of a document, oldest version first.
    async fn history(&self, id: DocumentId) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Ids of every stored document.
    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;
}

/// Validate and apply a conditional update to a stored row.
pub(crate) fn check_update(
    document: &mut CollaborativeDocument,
    update: DocumentUpdate,
) -> Result<(), StoreError> {
    if update.version != document.version + 1 {
        return Err(StoreError::VersionConflict {
            current: document.version,
            attempted: update.version,
        });
    }
    document.content = update.content;
    document.version = update.version;
    document.last_edited_by = update.last_edited_by;
    document.last_edited_at = update.last_edited_at;
    Ok(())
}

/// Apply a lock set/clear to a stored row.
///
/// Re-locking by the current holder is a no-op that keeps `locked_at`.
pub(crate) fn apply_lock(
    document: &mut CollaborativeDocument,
    holder: Option<UserId>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match (holder, document.locked_by) {
        (Some(user), Some(current)) if user != current => Err(StoreError::Locked {
            document_id: document.id,
            holder: current,
        }),
        (Some(_), Some(_)) => Ok(()),
        (Some(user), None) => {
            document.locked_by = Some(user);
            document.locked_at = Some(now);
            Ok(())
        }
        (None, _) => {
            document.locked_by = None;
            document.locked_at = None;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::timestamp_now;

    fn doc() -> CollaborativeDocument {
        CollaborativeDocument::new(DocumentId::new(), "Hello", UserId::new())
    }

    fn update_to(version: u64) -> DocumentUpdate {
        DocumentUpdate {
            content: "Hello World".into(),
            version,
            last_edited_by: UserId::new(),
            last_edited_at: timestamp_now(),
        }
    }

    #[test]
    fn test_update_requires_next_version() {
        let mut d = doc();
        assert_eq!(
            check_update(&mut d, update_to(3)),
            Err(StoreError::VersionConflict { current: 1, attempted: 3 })
        );
        assert_eq!(
            check_update(&mut d, update_to(1)),
            Err(StoreError::VersionConflict { current: 1, attempted: 1 })
        );
        assert_eq!(d.content, "Hello");

        check_update(&mut d, update_to(2)).unwrap();
        assert_eq!(d.version, 2);
        assert_eq!(d.content, "Hello World");
    }

    #[test]
    fn test_lock_rules() {
        let mut d = doc();
        let a = UserId::new();
        let b = UserId::new();
        let t0 = timestamp_now();

        apply_lock(&mut d, Some(a), t0).unwrap();
        assert_eq!(d.locked_by, Some(a));

        let err = apply_lock(&mut d, Some(b), t0).unwrap_err();
        assert_eq!(err, StoreError::Locked { document_id: d.id, holder: a });
        assert_eq!(d.locked_by, Some(a));

        let later = t0 + chrono::Duration::seconds(5);
        apply_lock(&mut d, Some(a), later).unwrap();
        assert_eq!(d.locked_at, Some(t0));

        apply_lock(&mut d, None, later).unwrap();
        assert!(d.locked_by.is_none());
        assert!(d.locked_at.is_none());
    }
}
