//! Integration tests for the RocksDB-backed document store.
//!
//! Documents, history and locks written through the public API must
//! survive closing and reopening the database.

use std::sync::Arc;

use scroll_collab::error::CollabError;
use scroll_collab::model::{DocumentId, UserId};
use scroll_collab::service::{DocumentService, UpdateRequest};
use scroll_collab::storage::{DocumentStore, RocksStore, StoreConfig, StoreError};
use scroll_collab::synchronizer::{DocumentSynchronizer, SyncConfig};
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

#[tokio::test]
async fn test_documents_survive_reopen() {
    let dir = tempdir().unwrap();
    let author = UserId::new();

    let doc_id = {
        let store = open(dir.path());
        let service = DocumentService::new(store.clone());
        let doc = service.create_document(author, "first draft").await.unwrap();
        service
            .update_document(doc.id, UpdateRequest::new(author, "second draft"))
            .await
            .unwrap();
        service.lock_document(doc.id, author).await.unwrap();
        store.sync().unwrap();
        doc.id
    };

    let store = open(dir.path());
    let doc = store.get(doc_id).await.unwrap();
    assert_eq!(doc.content, "second draft");
    assert_eq!(doc.version, 2);
    assert_eq!(doc.last_edited_by, author);
    assert_eq!(doc.locked_by, Some(author));
    assert!(doc.locked_at.is_some());

    let versions: Vec<u64> = store.history(doc_id).await.unwrap().iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(store.list_documents().await.unwrap(), vec![doc_id]);
}

#[tokio::test]
async fn test_version_check_after_reopen() {
    let dir = tempdir().unwrap();
    let author = UserId::new();

    let doc_id = {
        let service = DocumentService::new(open(dir.path()));
        service.create_document(author, "v1").await.unwrap().id
    };

    let store = open(dir.path());
    let stale = DocumentSynchronizer::new(store.clone(), author, SyncConfig::for_testing());
    let fresh = DocumentSynchronizer::new(store.clone(), author, SyncConfig::for_testing());
    stale.load(doc_id).await.unwrap();
    fresh.load(doc_id).await.unwrap();

    fresh.update_content("v2", true).await.unwrap();
    assert_eq!(
        stale.update_content("v2 (stale)", true).await,
        Err(CollabError::VersionConflict { current: 2, attempted: 2 })
    );
    assert_eq!(store.get(doc_id).await.unwrap().content, "v2");
}

#[tokio::test]
async fn test_history_is_scoped_per_document() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let service = DocumentService::new(store.clone());
    let author = UserId::new();

    let a = service.create_document(author, "a1").await.unwrap();
    let b = service.create_document(author, "b1").await.unwrap();
    for content in ["a2", "a3"] {
        service
            .update_document(a.id, UpdateRequest::new(author, content))
            .await
            .unwrap();
    }

    let history_a = service.document_history(a.id).await.unwrap();
    let history_b = service.document_history(b.id).await.unwrap();
    assert_eq!(history_a.len(), 3);
    assert_eq!(history_a.last().unwrap().content, "a3");
    assert_eq!(history_b.len(), 1);
    assert!(history_a.iter().all(|e| e.document_id == a.id));
}

#[tokio::test]
async fn test_large_document_round_trips() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let service = DocumentService::new(store.clone());
    let author = UserId::new();

    let content = "The quick brown fox jumps over the lazy dog. ".repeat(20_000);
    let doc = service.create_document(author, content.clone()).await.unwrap();
    assert_eq!(store.get(doc.id).await.unwrap().content, content);
}

#[tokio::test]
async fn test_missing_and_duplicate_documents() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());
    let missing = DocumentId::new();

    assert!(matches!(store.get(missing).await, Err(StoreError::NotFound(_))));
    assert!(matches!(store.set_lock(missing, None).await, Err(StoreError::NotFound(_))));

    let service = DocumentService::new(store.clone());
    let doc = service.create_document(UserId::new(), "once").await.unwrap();
    assert!(matches!(store.create(doc.clone()).await, Err(StoreError::AlreadyExists(_))));
}
