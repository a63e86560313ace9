//! Document service: the request/response surface over the store.
//!
//! Each operation maps onto one store or lock call. Server-side updates
//! go through the same version compare-and-swap as client commits, so a
//! request racing a client edit fails with `VersionConflict` instead of
//! overwriting it.

use std::sync::Arc;

use crate::error::Result;
use crate::lock::LockCoordinator;
use crate::model::{
    timestamp_now, CollaborativeDocument, DocumentId, DocumentUpdate, HistoryEntry, LockInfo, UserId,
};
use crate::storage::DocumentStore;

/// Lock change requested alongside an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockToggle {
    Lock,
    Unlock,
}

/// Body of an `update_document` request.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub user_id: UserId,
    pub content: String,
    /// If set, the update only applies on top of this version.
    pub base_version: Option<u64>,
    pub lock: Option<LockToggle>,
}

impl UpdateRequest {
    pub fn new(user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            user_id,
            content: content.into(),
            base_version: None,
            lock: None,
        }
    }

    pub fn based_on(mut self, version: u64) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_lock(mut self, toggle: LockToggle) -> Self {
        self.lock = Some(toggle);
        self
    }
}

pub struct DocumentService {
    store: Arc<dyn DocumentStore>,
    locks: LockCoordinator,
}

impl DocumentService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            locks: LockCoordinator::new(store.clone()),
            store,
        }
    }

    /// Create a document at version 1 and record its first snapshot.
    pub async fn create_document(
        &self,
        author: UserId,
        content: impl Into<String>,
    ) -> Result<CollaborativeDocument> {
        let document = CollaborativeDocument::new(DocumentId::new(), content, author);
        let document = self.store.create(document).await?;
        self.store.append_history(HistoryEntry::from(&document)).await?;
        log::info!("Document {} created by {author}", document.id);
        Ok(document)
    }

    pub async fn fetch_document(&self, document_id: DocumentId) -> Result<CollaborativeDocument> {
        Ok(self.store.get(document_id).await?)
    }

    /// Replace content, then apply the requested lock change.
    pub async fn update_document(
        &self,
        document_id: DocumentId,
        request: UpdateRequest,
    ) -> Result<CollaborativeDocument> {
        let base = match request.base_version {
            Some(version) => version,
            None => self.store.get(document_id).await?.version,
        };
        let update = DocumentUpdate {
            content: request.content,
            version: base + 1,
            last_edited_by: request.user_id,
            last_edited_at: timestamp_now(),
        };
        let mut document = self.store.update(document_id, update).await?;
        self.store.append_history(HistoryEntry::from(&document)).await?;

        match request.lock {
            Some(LockToggle::Lock) => {
                self.locks.lock(document_id, request.user_id).await?;
                document = self.store.get(document_id).await?;
            }
            Some(LockToggle::Unlock) => {
                self.locks.unlock(document_id).await?;
                document = self.store.get(document_id).await?;
            }
            None => {}
        }
        Ok(document)
    }

    pub async fn lock_document(&self, document_id: DocumentId, user_id: UserId) -> Result<LockInfo> {
        self.locks.lock(document_id, user_id).await
    }

    pub async fn unlock_document(&self, document_id: DocumentId) -> Result<()> {
        self.locks.unlock(document_id).await
    }

    pub async fn lock_status(&self, document_id: DocumentId) -> Result<Option<LockInfo>> {
        self.locks.lock_status(document_id).await
    }

    /// Snapshots of every committed version, oldest first.
    pub async fn document_history(&self, document_id: DocumentId) -> Result<Vec<HistoryEntry>> {
        // Distinguish "no such document" from "no history yet".
        self.store.get(document_id).await?;
        Ok(self.store.history(document_id).await?)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentId>> {
        Ok(self.store.list_documents().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollabError;
    use crate::storage::MemoryStore;

    fn service() -> DocumentService {
        DocumentService::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_fetch_update() {
        let svc = service();
        let author = UserId::new();
        let doc = svc.create_document(author, "draft").await.unwrap();
        assert_eq!(doc.version, 1);

        let updated = svc
            .update_document(doc.id, UpdateRequest::new(author, "final"))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(svc.fetch_document(doc.id).await.unwrap().content, "final");

        let versions: Vec<u64> = svc
            .document_history(doc.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stale_base_version_conflicts() {
        let svc = service();
        let author = UserId::new();
        let doc = svc.create_document(author, "a").await.unwrap();
        svc.update_document(doc.id, UpdateRequest::new(author, "b")).await.unwrap();

        let err = svc
            .update_document(doc.id, UpdateRequest::new(author, "c").based_on(1))
            .await
            .unwrap_err();
        assert_eq!(err, CollabError::VersionConflict { current: 2, attempted: 2 });
        assert_eq!(svc.fetch_document(doc.id).await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn test_update_with_lock_toggle() {
        let svc = service();
        let author = UserId::new();
        let doc = svc.create_document(author, "a").await.unwrap();

        let locked = svc
            .update_document(doc.id, UpdateRequest::new(author, "b").with_lock(LockToggle::Lock))
            .await
            .unwrap();
        assert_eq!(locked.locked_by, Some(author));

        let unlocked = svc
            .update_document(doc.id, UpdateRequest::new(author, "c").with_lock(LockToggle::Unlock))
            .await
            .unwrap();
        assert!(unlocked.locked_by.is_none());
        assert_eq!(unlocked.version, 3);
    }

    #[tokio::test]
    async fn test_history_of_missing_document() {
        let svc = service();
        let id = DocumentId::new();
        assert_eq!(svc.document_history(id).await, Err(CollabError::NotFound(id)));
    }
}
