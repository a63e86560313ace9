//! Optimistic document synchronizer.
//!
//! Lifecycle of a local edit:
//!
//! ```text
//! update_content("Hello World", optimistic)
//!     │ 1. apply locally, record PendingEdit, emit LocalApplied   (no await yet)
//!     │ 2. broadcast content_update                              (best-effort)
//!     │ 3. store.update(version + 1)                             (bounded by timeout)
//!     ▼
//!  success ──► drop PendingEdit, append history, emit Committed
//!  failure ──► restore pre-edit content/version, emit RolledBack
//! ```
//!
//! Several `update_content` calls may be in flight at once: state sits
//! behind an async mutex that is never held across a store or channel
//! await. Each edit id doubles as a commit sequence number. A response
//! for an edit that has a newer pending edit, or that is older than the
//! last committed edit, only resolves its own `PendingEdit` and never
//! touches local content. A failed edit that still has a pending
//! successor hands its pre-edit snapshot to that successor, so rolling
//! the successor back later restores text the store actually accepted.
//!
//! Remote edits (`apply_edit`) are applied blindly on top of the cached
//! content, pending local edits or not. There is no merge.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use crate::broadcast::BroadcastSender;
use crate::error::{CollabError, Result};
use crate::model::{CollaborativeDocument, DocumentId, DocumentUpdate, Edit, EditId, HistoryEntry, PendingEdit, UserId};
use crate::protocol::{ChannelMessage, EventKind};
use crate::storage::DocumentStore;

/// Synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on every store read and write (default: 10s)
    pub request_timeout: Duration,
    /// Append a history snapshot after each commit (default: true)
    pub record_history: bool,
    /// Capacity of the event channel (default: 256)
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            record_history: true,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

/// Why a pending edit was reverted.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    /// The store write failed or timed out.
    Failed(CollabError),
    /// `rollback_edit` was called.
    Explicit,
}

/// Events surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Loaded(CollaborativeDocument),
    /// A local edit is visible before its write completes.
    LocalApplied { edit_id: EditId, document: CollaborativeDocument },
    Committed { edit_id: EditId, version: u64 },
    /// Local state reverted; `document` is the state now shown.
    RolledBack {
        edit_id: EditId,
        document: Option<CollaborativeDocument>,
        reason: RollbackReason,
    },
    RemoteApplied { edit: Edit, document: CollaborativeDocument },
}

/// Result of a successful `update_content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Written and reflected locally.
    Committed { edit_id: EditId, version: u64 },
    /// Written, but a newer local edit (or a rollback) owns local state.
    Superseded { edit_id: EditId, version: u64 },
}

#[derive(Default)]
struct SyncState {
    document: Option<CollaborativeDocument>,
    pending: BTreeMap<EditId, PendingEdit>,
    /// Last edit id handed out.
    last_issued: u64,
    last_committed: Option<EditId>,
}

impl SyncState {
    /// True when `edit_id` still owns local state: nothing newer is
    /// pending and nothing newer has committed.
    fn owns_local_state(&self, edit_id: EditId) -> bool {
        let newer_pending = self.pending.range(edit_id..).any(|(id, _)| *id > edit_id);
        let newer_committed = self.last_committed.is_some_and(|c| c > edit_id);
        !newer_pending && !newer_committed
    }
}

/// Per-client, per-document synchronizer.
pub struct DocumentSynchronizer {
    store: Arc<dyn DocumentStore>,
    user_id: UserId,
    broadcaster: Option<BroadcastSender>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl DocumentSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, user_id: UserId, config: SyncConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            store,
            user_id,
            broadcaster: None,
            config,
            state: Mutex::new(SyncState::default()),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Announce local edits on a broadcast channel.
    pub fn with_broadcaster(mut self, broadcaster: BroadcastSender) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::trace!("Sync event not delivered: {e}");
        }
    }

    // ─── Loading ──────────────────────────────────────────────────────

    /// Fetch `document_id` and make it the local baseline.
    ///
    /// Discards any pending edits of a previously loaded document. On
    /// failure nothing is loaded.
    pub async fn load(&self, document_id: DocumentId) -> Result<CollaborativeDocument> {
        let fetched = match tokio::time::timeout(self.config.request_timeout, self.store.get(document_id)).await {
            Ok(Ok(document)) => Ok(document),
            Ok(Err(e)) => Err(CollabError::from(e)),
            Err(_) => Err(CollabError::Timeout(self.config.request_timeout)),
        };

        let mut state = self.state.lock().await;
        state.pending.clear();
        match fetched {
            Ok(document) => {
                log::debug!("Loaded {} at version {}", document.id, document.version);
                state.document = Some(document.clone());
                self.emit(SyncEvent::Loaded(document.clone()));
                Ok(document)
            }
            Err(e) => {
                log::warn!("Failed to load {document_id}: {e}");
                state.document = None;
                Err(e)
            }
        }
    }

    /// Snapshot of the local (possibly optimistic) state.
    pub async fn document(&self) -> Option<CollaborativeDocument> {
        self.state.lock().await.document.clone()
    }

    /// Ids of edits awaiting a store response, oldest first.
    pub async fn pending_edits(&self) -> Vec<EditId> {
        self.state.lock().await.pending.keys().copied().collect()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Replace the whole content and commit it.
    ///
    /// With `optimistic` the change is visible locally before the write
    /// completes and is reverted if the write fails. Without it, local
    /// state only changes once the store accepts the write.
    pub async fn update_content(
        &self,
        new_content: impl Into<String>,
        optimistic: bool,
    ) -> Result<CommitOutcome> {
        let (edit, document_id, update) = {
            let mut state = self.state.lock().await;
            let Some(document) = state.document.clone() else {
                return Err(CollabError::NotLoaded);
            };
            state.last_issued += 1;
            let edit = Edit::replace(EditId(state.last_issued), self.user_id, new_content);

            let update = DocumentUpdate {
                content: edit.content.clone(),
                version: document.version + 1,
                last_edited_by: self.user_id,
                last_edited_at: edit.timestamp,
            };
            let pending = PendingEdit {
                edit: edit.clone(),
                previous_content: document.content.clone(),
                previous_version: document.version,
                previous_edited_by: document.last_edited_by,
                previous_edited_at: document.last_edited_at,
                optimistic,
            };
            state.pending.insert(edit.id, pending);

            if optimistic {
                if let Some(local) = state.document.as_mut() {
                    local.content = update.content.clone();
                    local.version = update.version;
                    local.last_edited_by = self.user_id;
                    local.last_edited_at = edit.timestamp;
                    self.emit(SyncEvent::LocalApplied {
                        edit_id: edit.id,
                        document: local.clone(),
                    });
                }
            }
            (edit, document.id, update)
        };

        if let Some(broadcaster) = &self.broadcaster {
            if let Err(e) = broadcaster.send_edit(&edit).await {
                log::warn!("Content update {} not broadcast: {e}", edit.id);
            }
        }

        let written = match tokio::time::timeout(
            self.config.request_timeout,
            self.store.update(document_id, update),
        )
        .await
        {
            Ok(Ok(document)) => Ok(document),
            Ok(Err(e)) => Err(CollabError::from(e)),
            Err(_) => Err(CollabError::Timeout(self.config.request_timeout)),
        };

        match written {
            Ok(committed) => Ok(self.resolve_success(edit.id, committed).await),
            Err(e) => {
                log::warn!("Commit of {} to {document_id} failed: {e}", edit.id);
                self.resolve_failure(edit.id, e.clone()).await;
                Err(e)
            }
        }
    }

    async fn resolve_success(&self, edit_id: EditId, committed: CollaborativeDocument) -> CommitOutcome {
        let version = committed.version;
        let outcome = {
            let mut state = self.state.lock().await;
            let pending = state.pending.remove(&edit_id);
            let owns = pending.is_some() && state.owns_local_state(edit_id);
            state.last_committed = Some(state.last_committed.map_or(edit_id, |c| c.max(edit_id)));

            match (pending, state.document.as_mut()) {
                (Some(_), Some(local)) if owns && local.id == committed.id => {
                    // The stored row wins, even over an optimistic copy that
                    // an explicit rollback has since rewound.
                    *local = committed.clone();
                    CommitOutcome::Committed { edit_id, version }
                }
                _ => {
                    log::debug!("Commit of {edit_id} superseded locally");
                    CommitOutcome::Superseded { edit_id, version }
                }
            }
        };

        self.emit(SyncEvent::Committed { edit_id, version });
        log::debug!("Committed {edit_id} as version {version} of {}", committed.id);

        if self.config.record_history {
            if let Err(e) = self.store.append_history(HistoryEntry::from(&committed)).await {
                log::warn!("History snapshot for {} v{version} not recorded: {e}", committed.id);
            }
        }
        outcome
    }

    async fn resolve_failure(&self, edit_id: EditId, error: CollabError) {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending.remove(&edit_id) else {
            return;
        };

        // A newer pending edit was built on top of this one: it inherits
        // this edit's baseline and stays in charge of local state.
        if hand_down_baseline(&mut state.pending, edit_id, &pending) {
            return;
        }
        if !state.owns_local_state(edit_id) {
            return;
        }

        let restored = if pending.optimistic {
            restore(state.document.as_mut(), &pending)
        } else {
            state.document.clone()
        };
        drop(state);

        self.emit(SyncEvent::RolledBack {
            edit_id,
            document: restored,
            reason: RollbackReason::Failed(error),
        });
    }

    /// Revert a pending edit now, without waiting for its store response.
    pub async fn rollback_edit(&self, edit_id: EditId) -> Result<CollaborativeDocument> {
        let mut state = self.state.lock().await;
        let pending = state.pending.remove(&edit_id).ok_or(CollabError::UnknownEdit(edit_id))?;
        hand_down_baseline(&mut state.pending, edit_id, &pending);
        let restored = if pending.optimistic {
            restore(state.document.as_mut(), &pending)
        } else {
            state.document.clone()
        };
        drop(state);

        let document = restored.ok_or(CollabError::NotLoaded)?;
        log::info!("Rolled back {edit_id}, {} now at version {}", document.id, document.version);
        self.emit(SyncEvent::RolledBack {
            edit_id,
            document: Some(document.clone()),
            reason: RollbackReason::Explicit,
        });
        Ok(document)
    }

    // ─── Remote edits ─────────────────────────────────────────────────

    /// Apply an edit received from another client.
    ///
    /// Bumps the local version by one. Pending local edits are not
    /// reconciled.
    pub async fn apply_edit(&self, edit: Edit) -> Result<CollaborativeDocument> {
        let mut state = self.state.lock().await;
        let pending = state.pending.len();
        let local = state.document.as_mut().ok_or(CollabError::NotLoaded)?;
        if pending > 0 {
            log::debug!(
                "Applying remote {:?} from {} over {pending} pending local edit(s)",
                edit.kind,
                edit.user_id
            );
        }

        local.content = edit.apply_to(&local.content);
        local.version += 1;
        local.last_edited_by = edit.user_id;
        local.last_edited_at = edit.timestamp;
        let document = local.clone();
        drop(state);

        self.emit(SyncEvent::RemoteApplied {
            edit,
            document: document.clone(),
        });
        Ok(document)
    }

    /// Route a broadcast channel message. Returns true if it changed
    /// local content; own messages and cursor traffic are ignored.
    pub async fn handle_message(&self, message: &ChannelMessage) -> Result<bool> {
        if message.kind != EventKind::ContentUpdate || message.user_id == self.user_id {
            return Ok(false);
        }
        let edit = message.edit()?;
        self.apply_edit(edit).await?;
        Ok(true)
    }
}

/// Give the next newer pending edit the pre-edit snapshot of `edit_id`.
/// Returns false if there is none.
fn hand_down_baseline(
    pending: &mut BTreeMap<EditId, PendingEdit>,
    edit_id: EditId,
    resolved: &PendingEdit,
) -> bool {
    let Some((_, successor)) = pending.range_mut(edit_id..).next() else {
        return false;
    };
    successor.previous_content = resolved.previous_content.clone();
    successor.previous_version = resolved.previous_version;
    successor.previous_edited_by = resolved.previous_edited_by;
    successor.previous_edited_at = resolved.previous_edited_at;
    true
}

/// Put a pending edit's snapshot back into the local document.
fn restore(
    document: Option<&mut CollaborativeDocument>,
    pending: &PendingEdit,
) -> Option<CollaborativeDocument> {
    let document = document?;
    document.content = pending.previous_content.clone();
    document.version = pending.previous_version;
    document.last_edited_by = pending.previous_edited_by;
    document.last_edited_at = pending.previous_edited_at;
    Some(document.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn loaded(content: &str) -> (Arc<MemoryStore>, DocumentSynchronizer, DocumentId) {
        let store = Arc::new(MemoryStore::new());
        let doc = CollaborativeDocument::new(DocumentId::new(), content, UserId::new());
        let id = doc.id;
        store.create(doc).await.unwrap();
        let sync = DocumentSynchronizer::new(store.clone(), UserId::new(), SyncConfig::for_testing());
        sync.load(id).await.unwrap();
        (store, sync, id)
    }

    #[tokio::test]
    async fn test_edit_before_load() {
        let sync = DocumentSynchronizer::new(Arc::new(MemoryStore::new()), UserId::new(), SyncConfig::default());
        assert_eq!(sync.update_content("x", true).await, Err(CollabError::NotLoaded));
        assert!(sync.pending_edits().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_document() {
        let sync = DocumentSynchronizer::new(Arc::new(MemoryStore::new()), UserId::new(), SyncConfig::default());
        let id = DocumentId::new();
        assert_eq!(sync.load(id).await, Err(CollabError::NotFound(id)));
        assert!(sync.document().await.is_none());
    }

    #[tokio::test]
    async fn test_commit_clears_pending_and_records_history() {
        let (store, sync, id) = loaded("Hello").await;

        let outcome = sync.update_content("Hello World", true).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { edit_id: EditId(1), version: 2 });
        assert!(sync.pending_edits().await.is_empty());

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.content, "Hello World");
        assert_eq!(stored.last_edited_by, sync.user_id());
        assert_eq!(store.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_event_order() {
        let (_store, mut sync, _id) = loaded("a").await;
        let mut events = sync.take_event_rx().unwrap();
        assert!(sync.take_event_rx().is_none());

        sync.update_content("b", true).await.unwrap();

        assert!(matches!(events.recv().await, Some(SyncEvent::Loaded(_))));
        match events.recv().await {
            Some(SyncEvent::LocalApplied { document, .. }) => {
                assert_eq!(document.content, "b");
                assert_eq!(document.version, 2);
            }
            other => panic!("expected LocalApplied, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(SyncEvent::Committed { version: 2, .. })));
    }

    #[tokio::test]
    async fn test_explicit_rollback() {
        let (_store, sync, _id) = loaded("a").await;
        assert_eq!(
            sync.rollback_edit(EditId(42)).await,
            Err(CollabError::UnknownEdit(EditId(42)))
        );
    }

    #[tokio::test]
    async fn test_remote_insert_and_delete() {
        let (_store, sync, _id) = loaded("Hello World").await;
        let remote = UserId::new();

        let doc = sync.apply_edit(Edit::insert(EditId(1), remote, 5, ",")).await.unwrap();
        assert_eq!(doc.content, "Hello, World");
        assert_eq!(doc.version, 2);

        let doc = sync.apply_edit(Edit::delete(EditId(2), remote, 5, ", ")).await.unwrap();
        assert_eq!(doc.content, "HelloWorld");
        assert_eq!(doc.version, 3);
        assert_eq!(doc.last_edited_by, remote);
    }

    #[tokio::test]
    async fn test_own_messages_ignored() {
        let (_store, sync, _id) = loaded("a").await;
        let own = Edit::replace(EditId(9), sync.user_id(), "zzz");
        let msg = ChannelMessage::content_update(sync.user_id(), 1, &own).unwrap();

        assert!(!sync.handle_message(&msg).await.unwrap());
        assert_eq!(sync.document().await.unwrap().content, "a");
    }
}
