//! In-memory document store.
//!
//! Used by tests, demos and single-process deployments. Rows live in a
//! `HashMap` behind a tokio `RwLock`; history is kept per document in
//! commit order.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{apply_lock, check_update, DocumentStore, StoreError};
use crate::model::{
    timestamp_now, CollaborativeDocument, DocumentId, DocumentUpdate, HistoryEntry, UserId,
};

#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, CollaborativeDocument>>,
    history: RwLock<HashMap<DocumentId, Vec<HistoryEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: DocumentId) -> Result<CollaborativeDocument, StoreError> {
        self.documents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn create(&self, document: CollaborativeDocument) -> Result<CollaborativeDocument, StoreError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document.id) {
            return Err(StoreError::AlreadyExists(document.id));
        }
        documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn update(
        &self,
        id: DocumentId,
        update: DocumentUpdate,
    ) -> Result<CollaborativeDocument, StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        check_update(document, update)?;
        Ok(document.clone())
    }

    async fn set_lock(
        &self,
        id: DocumentId,
        holder: Option<UserId>,
    ) -> Result<CollaborativeDocument, StoreError> {
        let mut documents = self.documents.write().await;
        let document = documents.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_lock(document, holder, timestamp_now())?;
        Ok(document.clone())
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError> {
        let mut history = self.history.write().await;
        let entries = history.entry(entry.document_id).or_default();
        entries.push(entry);
        entries.sort_by_key(|e| e.version);
        Ok(())
    }

    async fn history(&self, id: DocumentId) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.history.read().await.get(&id).cloned().unwrap_or_default())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let mut ids: Vec<DocumentId> = self.documents.read().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_update(doc: &CollaborativeDocument, content: &str, by: UserId) -> DocumentUpdate {
        DocumentUpdate {
            content: content.to_string(),
            version: doc.version + 1,
            last_edited_by: by,
            last_edited_at: timestamp_now(),
        }
    }

    #[tokio::test]
    async fn test_create_get() {
        let store = MemoryStore::new();
        let doc = CollaborativeDocument::new(DocumentId::new(), "v1", UserId::new());
        store.create(doc.clone()).await.unwrap();

        assert_eq!(store.get(doc.id).await.unwrap(), doc);
        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.create(doc.clone()).await,
            Err(StoreError::AlreadyExists(doc.id))
        );
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryStore::new();
        let id = DocumentId::new();
        assert_eq!(store.get(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_versions_increase_by_one() {
        let store = MemoryStore::new();
        let author = UserId::new();
        let mut doc = store
            .create(CollaborativeDocument::new(DocumentId::new(), "a", author))
            .await
            .unwrap();

        for (i, text) in ["b", "c", "d"].iter().enumerate() {
            doc = store.update(doc.id, next_update(&doc, text, author)).await.unwrap();
            assert_eq!(doc.version, i as u64 + 2);
        }

        // A replayed (stale) write is rejected and leaves the row alone.
        let stale = DocumentUpdate { version: 3, ..next_update(&doc, "x", author) };
        assert!(matches!(
            store.update(doc.id, stale).await,
            Err(StoreError::VersionConflict { current: 4, attempted: 3 })
        ));
        assert_eq!(store.get(doc.id).await.unwrap().content, "d");
    }

    #[tokio::test]
    async fn test_history_in_version_order() {
        let store = MemoryStore::new();
        let doc = CollaborativeDocument::new(DocumentId::new(), "a", UserId::new());
        let mut v2 = HistoryEntry::from(&doc);
        v2.version = 2;
        store.append_history(v2).await.unwrap();
        store.append_history(HistoryEntry::from(&doc)).await.unwrap();

        let versions: Vec<u64> = store.history(doc.id).await.unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(store.history(DocumentId::new()).await.unwrap().is_empty());
    }
}
