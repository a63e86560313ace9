//! Per-client session: one synchronizer/presence/cursor bundle per open
//! document view.
//!
//! ```text
//! CollabSession (one per client)
//!   └── views: DocumentId ──► DocumentView
//!                               ├── DocumentSynchronizer  ◄── content_update
//!                               ├── CursorRelay           ◄── cursor_update
//!                               ├── PresenceTracker       ◄── presence sync
//!                               └── BroadcastRelay        (inbound queue)
//! ```
//!
//! `pump` drains the inbound queue and routes each message; closing a
//! view leaves presence and drops its subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::broadcast::{BroadcastRelay, ChannelHub};
use crate::cursor::CursorRelay;
use crate::error::{CollabError, Result};
use crate::model::{CollaborativeDocument, DocumentId, UserId};
use crate::presence::PresenceTracker;
use crate::protocol::EventKind;
use crate::storage::DocumentStore;
use crate::synchronizer::{DocumentSynchronizer, SyncConfig, SyncEvent};

/// Everything one client holds for one open document.
pub struct DocumentView {
    pub synchronizer: Arc<DocumentSynchronizer>,
    pub presence: PresenceTracker,
    pub cursors: CursorRelay,
    relay: Option<BroadcastRelay>,
    events: Option<mpsc::Receiver<SyncEvent>>,
}

impl DocumentView {
    /// Whether inbound broadcast traffic is being received.
    pub fn is_connected(&self) -> bool {
        self.relay.is_some()
    }

    /// Take the synchronizer's event receiver.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events.take()
    }
}

/// What a `pump` call routed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub remote_edits: usize,
    pub cursor_updates: usize,
    pub presence_changed: bool,
}

pub struct CollabSession {
    hub: Arc<ChannelHub>,
    store: Arc<dyn DocumentStore>,
    user_id: UserId,
    display_name: String,
    config: SyncConfig,
    views: HashMap<DocumentId, DocumentView>,
}

impl CollabSession {
    pub fn new(
        hub: Arc<ChannelHub>,
        store: Arc<dyn DocumentStore>,
        user_id: UserId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            store,
            user_id,
            display_name: display_name.into(),
            config: SyncConfig::default(),
            views: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Open a view of `document_id`, or return the existing one.
    ///
    /// Fails only if the document can't be loaded. A broadcast channel that
    /// can't be joined leaves the view working locally without live traffic.
    pub async fn open(&mut self, document_id: DocumentId) -> Result<&mut DocumentView> {
        if !self.views.contains_key(&document_id) {
            let view = self.build_view(document_id).await?;
            self.views.insert(document_id, view);
        }
        self.views
            .get_mut(&document_id)
            .ok_or(CollabError::NotFound(document_id))
    }

    async fn build_view(&self, document_id: DocumentId) -> Result<DocumentView> {
        let sender = self.hub.sender(document_id, self.user_id);
        let mut synchronizer =
            DocumentSynchronizer::new(self.store.clone(), self.user_id, self.config.clone())
                .with_broadcaster(sender.clone());
        let events = synchronizer.take_event_rx();
        synchronizer.load(document_id).await?;

        let relay = match BroadcastRelay::connect(self.hub.clone(), document_id, self.user_id).await {
            Ok(relay) => Some(relay),
            Err(e) => {
                log::warn!("Live updates unavailable for {document_id}: {e}");
                None
            }
        };
        let presence =
            PresenceTracker::join(self.hub.clone(), document_id, self.user_id, &self.display_name).await;

        log::info!("User {} opened {document_id}", self.user_id);
        Ok(DocumentView {
            synchronizer: Arc::new(synchronizer),
            presence,
            cursors: CursorRelay::new(sender, &self.display_name),
            relay,
            events,
        })
    }

    /// Close a view. Returns false if it wasn't open.
    pub async fn close(&mut self, document_id: DocumentId) -> bool {
        let Some(mut view) = self.views.remove(&document_id) else {
            return false;
        };
        view.presence.leave().await;
        drop(view.relay.take());
        self.hub.remove_if_empty(&document_id.broadcast_channel()).await;
        self.hub.remove_if_empty(&document_id.presence_channel()).await;
        log::info!("User {} closed {document_id}", self.user_id);
        true
    }

    pub fn view(&self, document_id: DocumentId) -> Option<&DocumentView> {
        self.views.get(&document_id)
    }

    pub fn view_mut(&mut self, document_id: DocumentId) -> Option<&mut DocumentView> {
        self.views.get_mut(&document_id)
    }

    pub fn open_documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.views.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Local state of an open view.
    pub async fn document(&self, document_id: DocumentId) -> Option<CollaborativeDocument> {
        self.views.get(&document_id)?.synchronizer.document().await
    }

    /// Route every buffered channel message of a view.
    pub async fn pump(&mut self, document_id: DocumentId) -> Result<PumpReport> {
        let view = self
            .views
            .get_mut(&document_id)
            .ok_or(CollabError::NotLoaded)?;
        let mut report = PumpReport::default();

        let messages = view.relay.as_mut().map(BroadcastRelay::drain).unwrap_or_default();
        for message in messages {
            match message.kind {
                EventKind::ContentUpdate => match view.synchronizer.handle_message(&message).await {
                    Ok(true) => report.remote_edits += 1,
                    Ok(false) => {}
                    Err(e) => log::warn!("Dropping content update from {}: {e}", message.user_id),
                },
                EventKind::CursorUpdate => {
                    if view.cursors.handle_message(&message) {
                        report.cursor_updates += 1;
                    }
                }
            }
        }

        if view.presence.poll() {
            report.presence_changed = true;
            let online: HashSet<UserId> =
                view.presence.online_users().iter().map(|e| e.user_id).collect();
            view.cursors.retain_users(&online);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn setup() -> (Arc<ChannelHub>, Arc<MemoryStore>, DocumentId) {
        let hub = Arc::new(ChannelHub::default());
        let store = Arc::new(MemoryStore::new());
        let doc = CollaborativeDocument::new(DocumentId::new(), "notes", UserId::new());
        let id = doc.id;
        store.create(doc).await.unwrap();
        (hub, store, id)
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (hub, store, doc) = setup().await;
        let mut session = CollabSession::new(hub.clone(), store, UserId::new(), "Ana");

        session.open(doc).await.unwrap();
        session.open(doc).await.unwrap();
        assert_eq!(session.open_documents(), vec![doc]);
        assert_eq!(hub.online_users(doc).await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_missing_document() {
        let (hub, store, _doc) = setup().await;
        let mut session = CollabSession::new(hub, store, UserId::new(), "Ana");
        let missing = DocumentId::new();

        assert!(matches!(session.open(missing).await, Err(CollabError::NotFound(_))));
        assert!(session.open_documents().is_empty());
    }

    #[tokio::test]
    async fn test_close_tears_down() {
        let (hub, store, doc) = setup().await;
        let mut session = CollabSession::new(hub.clone(), store, UserId::new(), "Ana");

        session.open(doc).await.unwrap();
        assert!(session.close(doc).await);
        assert!(!session.close(doc).await);

        assert!(session.view(doc).is_none());
        assert!(hub.online_users(doc).await.is_empty());
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_pump_unknown_view() {
        let (hub, store, _doc) = setup().await;
        let mut session = CollabSession::new(hub, store, UserId::new(), "Ana");
        assert_eq!(session.pump(DocumentId::new()).await, Err(CollabError::NotLoaded));
    }

    #[tokio::test]
    async fn test_closed_hub_still_edits_locally() {
        let (hub, store, doc) = setup().await;
        hub.shutdown().await;
        let mut session = CollabSession::new(hub, store.clone(), UserId::new(), "Ana");

        let view = session.open(doc).await.unwrap();
        assert!(!view.is_connected());
        assert!(!view.presence.is_connected());

        view.synchronizer.update_content("notes v2", true).await.unwrap();
        assert_eq!(store.get(doc).await.unwrap().content, "notes v2");
    }
}
