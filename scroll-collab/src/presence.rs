//! Presence: who is looking at a document right now.
//!
//! ## Architecture
//!
//! ```text
//! PresenceTracker::join()
//!       │  subscribe "presence:{id}", then register
//!       ▼
//! ChannelHub::join_presence()  ──►  PresenceRoom (one per document)
//!       │
//!       ▼  full membership, never a diff
//! HubEvent::PresenceSync { entries }  ──►  every tracker replaces online_users
//! ```
//!
//! Leave (explicit, on drop, or through idle expiry) triggers the same
//! full-state sync. Syncs are published while the room lock is held, so
//! subscribers see them in the order the membership changed and the last
//! sync received is the current membership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broadcast::{ChannelHub, HubEvent, Subscription};
use crate::error::{CollabError, Result};
use crate::model::{timestamp_now, DocumentId, UserId};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGB color for a user's cursor and selection highlight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CursorColor {
    /// Stable, vivid color derived from the user id.
    ///
    /// Hue comes from the id, saturation and lightness are fixed so every
    /// cursor stays readable on a light background.
    pub fn from_user(user_id: UserId) -> Self {
        let hue = (user_id.0.as_u128() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    let channel = |t: f32| {
        let t = t.rem_euclid(1.0);
        if t < 1.0 / 6.0 {
            p + (q - p) * 6.0 * t
        } else if t < 0.5 {
            q
        } else if t < 2.0 / 3.0 {
            p + (q - p) * (2.0 / 3.0 - t) * 6.0
        } else {
            p
        }
    };
    (channel(h + 1.0 / 3.0), channel(h), channel(h - 1.0 / 3.0))
}

/// One user's presence in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    /// Fixed for the session, derived from `user_id`.
    pub cursor_color: CursorColor,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub joined_at: DateTime<Utc>,
    /// Refreshed by heartbeats.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        let now = timestamp_now();
        Self {
            user_id,
            display_name: display_name.into(),
            cursor_color: CursorColor::from_user(user_id),
            joined_at: now,
            last_seen: now,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room (authoritative membership, lives in the hub)
// ───────────────────────────────────────────────────────────────────

/// Membership of one document's presence channel.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    entries: HashMap<UserId, PresenceEntry>,
}

impl PresenceRoom {
    /// Add or refresh an entry. A repeated join keeps the original
    /// `joined_at` and takes the newer metadata. Returns true if the user
    /// was not present before.
    pub fn join(&mut self, mut entry: PresenceEntry) -> bool {
        match self.entries.get(&entry.user_id) {
            Some(existing) => {
                entry.joined_at = existing.joined_at;
                self.entries.insert(entry.user_id, entry);
                false
            }
            None => {
                self.entries.insert(entry.user_id, entry);
                true
            }
        }
    }

    pub fn leave(&mut self, user_id: UserId) -> Option<PresenceEntry> {
        self.entries.remove(&user_id)
    }

    /// Refresh `last_seen`. False if the user is not in the room.
    pub fn touch(&mut self, user_id: UserId, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(&user_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove entries last seen before `cutoff`.
    pub fn expire_before(&mut self, cutoff: DateTime<Utc>) -> Vec<UserId> {
        let stale: Vec<UserId> = self
            .entries
            .values()
            .filter(|e| e.last_seen < cutoff)
            .map(|e| e.user_id)
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    /// Current membership, oldest join first.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let mut entries: Vec<PresenceEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| (a.joined_at, a.user_id).cmp(&(b.joined_at, b.user_id)));
        entries
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ChannelHub {
    /// Register `entry` in the document's room and sync every member.
    /// Returns the membership after the join.
    pub async fn join_presence(
        &self,
        document_id: DocumentId,
        entry: PresenceEntry,
    ) -> Result<Vec<PresenceEntry>> {
        if self.is_closed() {
            return Err(CollabError::ChannelDisconnected(document_id.presence_channel()));
        }
        let user_id = entry.user_id;
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(document_id).or_default();
        let first_join = room.join(entry);
        let snapshot = room.snapshot();
        self.publish_presence(document_id, &snapshot).await;

        if first_join {
            log::info!("User {user_id} joined {document_id} ({} online)", snapshot.len());
        } else {
            log::debug!("User {user_id} re-joined {document_id}");
        }
        Ok(snapshot)
    }

    /// Remove a user from the document's room. Returns false if the user
    /// was not present.
    pub async fn leave_presence(&self, document_id: DocumentId, user_id: UserId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&document_id) else {
            return false;
        };
        if room.leave(user_id).is_none() {
            return false;
        }
        let snapshot = room.snapshot();
        if room.is_empty() {
            rooms.remove(&document_id);
        }
        self.publish_presence(document_id, &snapshot).await;
        log::info!("User {user_id} left {document_id} ({} online)", snapshot.len());
        true
    }

    /// Refresh a member's `last_seen`.
    pub async fn heartbeat(&self, document_id: DocumentId, user_id: UserId) -> bool {
        let now = timestamp_now();
        self.rooms
            .write()
            .await
            .get_mut(&document_id)
            .map(|room| room.touch(user_id, now))
            .unwrap_or(false)
    }

    /// Expire members idle longer than the configured timeout.
    pub async fn expire_idle(&self) -> Vec<(DocumentId, UserId)> {
        let timeout = chrono::Duration::from_std(self.config.presence_idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.expire_idle_before(timeout_cutoff(timeout)).await
    }

    /// Expire members last seen before `cutoff`, re-syncing every room
    /// that changed.
    pub async fn expire_idle_before(&self, cutoff: DateTime<Utc>) -> Vec<(DocumentId, UserId)> {
        let mut rooms = self.rooms.write().await;
        let mut expired = Vec::new();
        let mut changed = Vec::new();

        for (document_id, room) in rooms.iter_mut() {
            let stale = room.expire_before(cutoff);
            if !stale.is_empty() {
                expired.extend(stale.into_iter().map(|user| (*document_id, user)));
                changed.push((*document_id, room.snapshot()));
            }
        }
        rooms.retain(|_, room| !room.is_empty());

        for (document_id, snapshot) in &changed {
            self.publish_presence(*document_id, snapshot).await;
        }
        if !expired.is_empty() {
            log::info!("Expired {} idle presence entries", expired.len());
        }
        expired
    }

    /// Current membership of a document's room.
    pub async fn online_users(&self, document_id: DocumentId) -> Vec<PresenceEntry> {
        self.rooms
            .read()
            .await
            .get(&document_id)
            .map(PresenceRoom::snapshot)
            .unwrap_or_default()
    }

    /// Run `expire_idle` every `interval` until the hub shuts down.
    pub fn spawn_presence_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if hub.is_closed() {
                    break;
                }
                hub.expire_idle().await;
            }
        })
    }

    async fn publish_presence(&self, document_id: DocumentId, snapshot: &[PresenceEntry]) {
        let event = HubEvent::PresenceSync {
            document_id,
            entries: Arc::new(snapshot.to_vec()),
        };
        self.publish(&document_id.presence_channel(), event).await;
    }
}

fn timeout_cutoff(timeout: chrono::Duration) -> DateTime<Utc> {
    timestamp_now() - timeout
}

// ───────────────────────────────────────────────────────────────────
// Presence tracker (client side)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// The presence channel could not be established; `online_users` is empty.
    NotConnected,
    Connected,
    Left,
}

/// A client's view of a document's presence channel.
///
/// Dropping a connected tracker leaves the room.
pub struct PresenceTracker {
    hub: Arc<ChannelHub>,
    document_id: DocumentId,
    local: PresenceEntry,
    subscription: Option<Subscription>,
    online_users: Vec<PresenceEntry>,
    state: PresenceState,
}

impl PresenceTracker {
    /// Join the document's presence room.
    ///
    /// Never fails: if the channel can't be established the tracker stays
    /// `NotConnected` with no online users.
    pub async fn join(
        hub: Arc<ChannelHub>,
        document_id: DocumentId,
        user_id: UserId,
        display_name: impl Into<String>,
    ) -> Self {
        let mut tracker = Self {
            local: PresenceEntry::new(user_id, display_name),
            hub,
            document_id,
            subscription: None,
            online_users: Vec::new(),
            state: PresenceState::NotConnected,
        };

        // Subscribe before registering so our own join sync is not missed.
        let subscription = match tracker.hub.subscribe(&document_id.presence_channel()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                log::warn!("Presence unavailable for {document_id}: {e}");
                return tracker;
            }
        };

        match tracker.hub.join_presence(document_id, tracker.local.clone()).await {
            Ok(snapshot) => {
                tracker.online_users = snapshot;
                tracker.subscription = Some(subscription);
                tracker.state = PresenceState::Connected;
            }
            Err(e) => log::warn!("Presence join failed for {document_id}: {e}"),
        }
        tracker
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PresenceState::Connected
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The local user's entry.
    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    /// Membership as of the last sync received.
    pub fn online_users(&self) -> &[PresenceEntry] {
        &self.online_users
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.online_users.iter().any(|e| e.user_id == user_id)
    }

    /// Apply every buffered sync. Returns true if any arrived.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Some(event) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            changed |= self.apply(event);
        }
        changed
    }

    /// Wait for the next sync. `None` once the channel closes.
    pub async fn changed(&mut self) -> Option<&[PresenceEntry]> {
        loop {
            let event = match self.subscription.as_mut() {
                Some(subscription) => subscription.recv().await,
                None => return None,
            };
            match event {
                Some(event) => {
                    if self.apply(event) {
                        return Some(&self.online_users);
                    }
                }
                None => {
                    self.subscription = None;
                    self.online_users.clear();
                    self.state = PresenceState::NotConnected;
                    return None;
                }
            }
        }
    }

    fn apply(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::PresenceSync { document_id, entries } if document_id == self.document_id => {
                self.online_users = Arc::unwrap_or_clone(entries);
                true
            }
            _ => false,
        }
    }

    /// Refresh the local entry's `last_seen` on the hub.
    pub async fn heartbeat(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.hub.heartbeat(self.document_id, self.local.user_id).await
    }

    /// Leave the room explicitly.
    pub async fn leave(&mut self) {
        if self.is_connected() {
            self.hub.leave_presence(self.document_id, self.local.user_id).await;
        }
        self.subscription = None;
        self.online_users.clear();
        self.state = PresenceState::Left;
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if self.state != PresenceState::Connected {
            return;
        }
        // Implicit leave on disconnect
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let (document_id, user_id) = (self.document_id, self.local.user_id);
            handle.spawn(async move {
                hub.leave_presence(document_id, user_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_color_stable() {
        let user = UserId::new();
        assert_eq!(CursorColor::from_user(user), CursorColor::from_user(user));
        let hex = CursorColor::from_user(user).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_hsl_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_room_duplicate_join_collapses() {
        let mut room = PresenceRoom::default();
        let user = UserId::new();
        let first = PresenceEntry::new(user, "Ana");
        let joined_at = first.joined_at;

        assert!(room.join(first));
        let mut again = PresenceEntry::new(user, "Ana B.");
        again.joined_at = joined_at + chrono::Duration::seconds(10);
        assert!(!room.join(again));

        let snapshot = room.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].display_name, "Ana B.");
        assert_eq!(snapshot[0].joined_at, joined_at);
    }

    #[test]
    fn test_room_expiry() {
        let mut room = PresenceRoom::default();
        let (a, b) = (UserId::new(), UserId::new());
        room.join(PresenceEntry::new(a, "A"));
        room.join(PresenceEntry::new(b, "B"));

        let later = timestamp_now() + chrono::Duration::seconds(30);
        assert!(room.touch(b, later));
        let expired = room.expire_before(later);

        assert_eq!(expired, vec![a]);
        assert!(room.contains(b));
        assert!(!room.touch(a, later));
    }

    #[tokio::test]
    async fn test_join_syncs_every_member() {
        let hub = Arc::new(ChannelHub::default());
        let doc = DocumentId::new();
        let (ana, ben) = (UserId::new(), UserId::new());

        let mut a = PresenceTracker::join(hub.clone(), doc, ana, "Ana").await;
        assert_eq!(a.state(), PresenceState::Connected);
        assert_eq!(a.online_users().len(), 1);

        let b = PresenceTracker::join(hub.clone(), doc, ben, "Ben").await;
        assert_eq!(b.online_users().len(), 2);

        assert!(a.poll());
        assert!(a.is_online(ben));
        assert_eq!(a.online_users(), b.online_users());
    }

    #[tokio::test]
    async fn test_duplicate_join_is_idempotent() {
        let hub = Arc::new(ChannelHub::default());
        let doc = DocumentId::new();
        let user = UserId::new();

        let _first = PresenceTracker::join(hub.clone(), doc, user, "Ana").await;
        let second = PresenceTracker::join(hub.clone(), doc, user, "Ana").await;

        assert_eq!(second.online_users().len(), 1);
        assert_eq!(hub.online_users(doc).await.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_resyncs() {
        let hub = Arc::new(ChannelHub::default());
        let doc = DocumentId::new();
        let mut a = PresenceTracker::join(hub.clone(), doc, UserId::new(), "Ana").await;
        let mut b = PresenceTracker::join(hub.clone(), doc, UserId::new(), "Ben").await;

        b.leave().await;
        assert_eq!(b.state(), PresenceState::Left);
        assert!(b.online_users().is_empty());

        a.poll();
        assert_eq!(a.online_users().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_hub_leaves_tracker_disconnected() {
        let hub = Arc::new(ChannelHub::default());
        hub.shutdown().await;

        let tracker = PresenceTracker::join(hub, DocumentId::new(), UserId::new(), "Ana").await;
        assert_eq!(tracker.state(), PresenceState::NotConnected);
        assert!(tracker.online_users().is_empty());
        assert!(!tracker.heartbeat().await);
    }
}
