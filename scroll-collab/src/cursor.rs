//! Cursor relay: ephemeral caret and selection sharing.
//!
//! Cursor updates ride the document's broadcast channel as
//! `cursor_update` events and are never written to the store. Incoming
//! updates are cached last-value-wins per user; an update whose sequence
//! number is not newer than the last one seen from the same sender
//! epoch is dropped. A reopened view starts a new epoch. Outgoing updates are throttled (default 33ms, ~30fps).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::broadcast::BroadcastSender;
use crate::model::UserId;
use crate::presence::CursorColor;
use crate::protocol::{ChannelMessage, EventKind};

/// Default minimum interval between outgoing cursor updates.
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(33);

/// Selected character range, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

/// A user's caret as shown to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub user_id: UserId,
    pub display_name: String,
    /// Character offset into the content
    pub position: usize,
    pub selection: Option<Selection>,
    pub color: CursorColor,
}

#[derive(Debug, Clone)]
struct RemoteCursor {
    cursor: CursorPosition,
    epoch: Uuid,
    last_seq: u64,
    last_update: Instant,
}

/// Sends the local cursor and caches remote ones.
pub struct CursorRelay {
    sender: BroadcastSender,
    display_name: String,
    color: CursorColor,
    local: Option<CursorPosition>,
    remote: HashMap<UserId, RemoteCursor>,
    interval: Duration,
    last_broadcast: Option<Instant>,
}

impl CursorRelay {
    pub fn new(sender: BroadcastSender, display_name: impl Into<String>) -> Self {
        let color = CursorColor::from_user(sender.user_id());
        Self {
            sender,
            display_name: display_name.into(),
            color,
            local: None,
            remote: HashMap::new(),
            interval: DEFAULT_CURSOR_INTERVAL,
            last_broadcast: None,
        }
    }

    /// Create with custom throttle interval (for testing).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Record the local cursor and broadcast it unless throttled.
    /// Returns true if an update was sent.
    pub async fn send_cursor(&mut self, position: usize, selection: Option<Selection>) -> bool {
        self.local = Some(self.local_cursor(position, selection));
        let throttled = self
            .last_broadcast
            .is_some_and(|at| at.elapsed() < self.interval);
        if throttled {
            return false;
        }
        self.force_send().await
    }

    /// Broadcast the last recorded local cursor regardless of throttling.
    pub async fn force_send(&mut self) -> bool {
        let Some(cursor) = self.local.clone() else {
            return false;
        };
        self.last_broadcast = Some(Instant::now());
        match self.sender.send_cursor(&cursor).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Cursor update not sent: {e}");
                false
            }
        }
    }

    fn local_cursor(&self, position: usize, selection: Option<Selection>) -> CursorPosition {
        CursorPosition {
            user_id: self.sender.user_id(),
            display_name: self.display_name.clone(),
            position,
            selection,
            color: self.color,
        }
    }

    /// Handle an incoming channel message. Returns true if the cache changed.
    ///
    /// Own messages, non-cursor events, undecodable payloads and updates
    /// that are not newer than the cached one are ignored.
    pub fn handle_message(&mut self, message: &ChannelMessage) -> bool {
        if message.kind != EventKind::CursorUpdate || message.user_id == self.sender.user_id() {
            return false;
        }
        let cursor = match message.cursor() {
            Ok(cursor) => cursor,
            Err(e) => {
                log::warn!("Dropping malformed cursor update from {}: {e}", message.user_id);
                return false;
            }
        };

        if let Some(existing) = self.remote.get(&message.user_id) {
            // A new epoch is a fresh sender whose seq restarts at 1.
            if existing.epoch == message.epoch && message.seq <= existing.last_seq {
                log::trace!(
                    "Out-of-order cursor from {} (seq {} <= {})",
                    message.user_id,
                    message.seq,
                    existing.last_seq
                );
                return false;
            }
        }

        self.remote.insert(
            message.user_id,
            RemoteCursor {
                cursor,
                epoch: message.epoch,
                last_seq: message.seq,
                last_update: Instant::now(),
            },
        );
        true
    }

    pub fn cursor(&self, user_id: UserId) -> Option<&CursorPosition> {
        self.remote.get(&user_id).map(|r| &r.cursor)
    }

    /// All cached remote cursors.
    pub fn cursors(&self) -> Vec<&CursorPosition> {
        self.remote.values().map(|r| &r.cursor).collect()
    }

    pub fn local(&self) -> Option<&CursorPosition> {
        self.local.as_ref()
    }

    /// Forget a user's cursor (e.g. after they left).
    pub fn remove(&mut self, user_id: UserId) -> Option<CursorPosition> {
        self.remote.remove(&user_id).map(|r| r.cursor)
    }

    /// Keep only cursors of users in `online`.
    pub fn retain_users(&mut self, online: &HashSet<UserId>) {
        self.remote.retain(|user, _| online.contains(user));
    }

    /// Remove cursors not updated within `timeout`.
    pub fn cleanup_idle(&mut self, timeout: Duration) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .remote
            .iter()
            .filter(|(_, r)| r.last_update.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.remote.remove(id);
        }
        stale
    }
}
