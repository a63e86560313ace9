//! # scroll-collab: Real-time collaborative document sync
//!
//! Lets several users edit one shared text document at once: local edits
//! show up immediately, are committed to a durable store with a version
//! compare-and-swap, and are rolled back if the commit fails. Presence
//! and cursors travel over per-document pub/sub channels.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── CollabSession (per client) ───────────────────────┐
//! │  DocumentView (per open document)                                          │
//! │  ┌──────────────────────┐  ┌───────────────┐  ┌─────────────────┐          │
//! │  │ DocumentSynchronizer │  │ CursorRelay   │  │ PresenceTracker │          │
//! │  └───┬───────────┬──────┘  └──────┬────────┘  └───────┬─────────┘          │
//! └──────┼───────────┼────────────────┼───────────────────┼────────────────────┘
//!        │ CAS write │ content_update │ cursor_update     │ join / leave / sync
//!        ▼           ▼                ▼                   ▼
//! ┌─────────────┐  ┌───────────────────────────────────────────────┐
//! │DocumentStore│  │ ChannelHub  "document:{id}"  "presence:{id}"  │ ◄── RelayServer
//! │ Memory/Rocks│  └───────────────────────────────────────────────┘     (WebSocket)
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: documents, edits, pending edits, history, locks
//! - [`storage`]: `DocumentStore` trait, in-memory and RocksDB backends
//! - [`protocol`]: bincode channel messages and relay frames
//! - [`broadcast`]: channel hub, broadcast relay
//! - [`presence`]: presence rooms and tracker
//! - [`cursor`]: cursor relay
//! - [`lock`]: advisory lock coordinator
//! - [`synchronizer`]: optimistic document synchronizer
//! - [`session`]: per-client arena of open document views
//! - [`service`]: request/response document operations
//! - [`server`]: WebSocket relay server
//!
//! ## Known limitations
//!
//! Only whole-content replacement is committed. Concurrent edits from
//! different clients are resolved by the store's version check (the
//! loser rolls back); nothing is merged.

pub mod error;
pub mod model;
pub mod protocol;
pub mod storage;
pub mod broadcast;
pub mod presence;
pub mod cursor;
pub mod lock;
pub mod synchronizer;
pub mod session;
pub mod service;
pub mod server;

// Re-exports for convenience
pub use error::{CollabError, Result};
pub use model::{
    CollaborativeDocument, DocumentId, DocumentUpdate, Edit, EditId, EditKind, HistoryEntry,
    LockInfo, PendingEdit, UserId,
};
pub use protocol::{ChannelMessage, ClientFrame, EventKind, ProtocolError, ServerFrame};
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use broadcast::{
    BroadcastRelay, BroadcastSender, BroadcastStats, ChannelHub, HubConfig, HubEvent, Subscription,
};
pub use presence::{CursorColor, PresenceEntry, PresenceRoom, PresenceState, PresenceTracker};
pub use cursor::{CursorPosition, CursorRelay, Selection};
pub use lock::LockCoordinator;
pub use synchronizer::{CommitOutcome, DocumentSynchronizer, RollbackReason, SyncConfig, SyncEvent};
pub use session::{CollabSession, DocumentView, PumpReport};
pub use service::{DocumentService, LockToggle, UpdateRequest};
pub use server::{RelayServer, ServerConfig, ServerStats};
