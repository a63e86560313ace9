//! Advisory document locks.
//!
//! A lock is a cooperative flag stored on the document row. Nothing else
//! in the crate consults it before writing; clients are expected to check
//! `lock_status` and behave.

use std::sync::Arc;

use crate::error::{CollabError, Result};
use crate::model::{DocumentId, LockInfo, UserId};
use crate::storage::DocumentStore;

pub struct LockCoordinator {
    store: Arc<dyn DocumentStore>,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Take the lock for `user_id`.
    ///
    /// Fails with `AlreadyLocked` if another user holds it; the holder is
    /// left unchanged. Locking again as the current holder succeeds and
    /// keeps the original `locked_at`.
    pub async fn lock(&self, document_id: DocumentId, user_id: UserId) -> Result<LockInfo> {
        let document = self.store.set_lock(document_id, Some(user_id)).await.map_err(|e| {
            let err = CollabError::from(e);
            log::debug!("Lock on {document_id} refused for {user_id}: {err}");
            err
        })?;
        log::info!("Document {document_id} locked by {user_id}");
        document
            .lock_info()
            .ok_or_else(|| CollabError::StoreUnavailable(format!("lock on {document_id} not recorded")))
    }

    /// Clear the lock, whoever holds it.
    pub async fn unlock(&self, document_id: DocumentId) -> Result<()> {
        self.store.set_lock(document_id, None).await?;
        log::info!("Document {document_id} unlocked");
        Ok(())
    }

    /// Current holder, if any.
    pub async fn lock_status(&self, document_id: DocumentId) -> Result<Option<LockInfo>> {
        Ok(self.store.get(document_id).await?.lock_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CollaborativeDocument;
    use crate::storage::MemoryStore;

    async fn setup() -> (LockCoordinator, DocumentId) {
        let store = Arc::new(MemoryStore::new());
        let doc = CollaborativeDocument::new(DocumentId::new(), "notes", UserId::new());
        let id = doc.id;
        store.create(doc).await.unwrap();
        (LockCoordinator::new(store), id)
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let (locks, doc) = setup().await;
        let (a, b) = (UserId::new(), UserId::new());

        let info = locks.lock(doc, a).await.unwrap();
        assert_eq!(info.locked_by, a);

        let err = locks.lock(doc, b).await.unwrap_err();
        assert_eq!(err, CollabError::AlreadyLocked { document_id: doc, holder: a });
        assert_eq!(err.code(), "ALREADY_LOCKED");
        assert_eq!(locks.lock_status(doc).await.unwrap().unwrap().locked_by, a);
    }

    #[tokio::test]
    async fn test_relock_by_holder_keeps_timestamp() {
        let (locks, doc) = setup().await;
        let a = UserId::new();

        let first = locks.lock(doc, a).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = locks.lock(doc, a).await.unwrap();
        assert_eq!(first.locked_at, second.locked_at);
    }

    #[tokio::test]
    async fn test_unlock_has_no_owner_check() {
        let (locks, doc) = setup().await;
        locks.lock(doc, UserId::new()).await.unwrap();

        locks.unlock(doc).await.unwrap();
        assert!(locks.lock_status(doc).await.unwrap().is_none());

        let b = UserId::new();
        assert_eq!(locks.lock(doc, b).await.unwrap().locked_by, b);
    }

    #[tokio::test]
    async fn test_lock_missing_document() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockCoordinator::new(store);
        let id = DocumentId::new();
        assert_eq!(locks.lock(id, UserId::new()).await.unwrap_err(), CollabError::NotFound(id));
    }
}
