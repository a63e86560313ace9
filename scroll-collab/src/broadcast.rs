//! Channel hub and per-document broadcast relay.
//!
//! ```text
//!   BroadcastSender ──publish──► ChannelHub ──"document:{id}"──► BroadcastGroup
//!   (user A, seq n)              (named channels)                   │ tokio broadcast
//!                                                                   ▼
//!                                              Subscription (B) · Subscription (C) · ...
//! ```
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber buffers up to `capacity` events; a subscriber that falls
//! further behind loses the oldest events (at-most-once delivery), which
//! is counted in the group's stats.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::cursor::CursorPosition;
use crate::error::{CollabError, Result};
use crate::model::{DocumentId, Edit, UserId};
use crate::presence::{PresenceEntry, PresenceRoom};
use crate::protocol::{ChannelMessage, EventKind, ProtocolError};

/// Event carried by a hub channel.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Message on a document broadcast channel.
    Message(Arc<ChannelMessage>),
    /// Full membership of a presence room.
    PresenceSync {
        document_id: DocumentId,
        entries: Arc<Vec<PresenceEntry>>,
    },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Fan-out group for one named channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<HubEvent>,
    /// Events buffered per subscriber
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: HubEvent) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// A receiver attached to one hub channel.
pub struct Subscription {
    channel: String,
    /// Does not keep the group alive; the stream ends once the hub drops it.
    group: Weak<BroadcastGroup>,
    rx: broadcast::Receiver<HubEvent>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next event. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<HubEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn lagged(&self, n: u64) {
        log::warn!("Subscriber on '{}' lagged, {} events dropped", self.channel, n);
        if let Some(group) = self.group.upgrade() {
            group.record_dropped(n);
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Events buffered per subscriber (default: 256)
    pub channel_capacity: usize,
    /// Presence entries without a heartbeat for this long are expired
    pub presence_idle_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            presence_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Process-local pub/sub fabric: named channels plus presence rooms.
///
/// Each document gets its own channels so that traffic is isolated
/// between documents.
pub struct ChannelHub {
    channels: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    pub(crate) rooms: RwLock<HashMap<DocumentId, PresenceRoom>>,
    pub(crate) config: HubConfig,
    closed: AtomicBool,
}

impl ChannelHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get or create the group for a channel.
    async fn group(&self, channel: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(channel) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = channels.get(channel) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.config.channel_capacity));
        channels.insert(channel.to_string(), group.clone());
        log::debug!("Channel '{channel}' created");
        group
    }

    /// Subscribe to a channel, creating it on first use.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        if self.is_closed() {
            return Err(CollabError::ChannelDisconnected(channel.to_string()));
        }
        let group = self.group(channel).await;
        let rx = group.sender.subscribe();
        Ok(Subscription {
            channel: channel.to_string(),
            group: Arc::downgrade(&group),
            rx,
        })
    }

    /// Publish to a channel. Channels nobody ever subscribed to swallow
    /// the event. Returns the number of subscribers reached.
    pub async fn publish(&self, channel: &str, event: HubEvent) -> usize {
        if self.is_closed() {
            return 0;
        }
        let group = self.channels.read().await.get(channel).cloned();
        match group {
            Some(group) => group.publish(event),
            None => 0,
        }
    }

    /// Sending half of a document's broadcast channel for `user_id`.
    pub fn sender(self: &Arc<Self>, document_id: DocumentId, user_id: UserId) -> BroadcastSender {
        BroadcastSender {
            hub: self.clone(),
            channel: document_id.broadcast_channel(),
            user_id,
            epoch: Uuid::new_v4(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Remove a channel that has no subscribers left.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(channel) {
            if group.subscriber_count() == 0 {
                channels.remove(channel);
                log::debug!("Channel '{channel}' removed");
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self, channel: &str) -> Option<BroadcastStats> {
        self.channels.read().await.get(channel).map(|g| g.stats())
    }

    /// Close every channel. Subscribers see end-of-stream and new
    /// subscriptions fail with `ChannelDisconnected`.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.write().await.clear();
        self.rooms.write().await.clear();
        log::info!("Channel hub shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

// ───────────────────────────────────────────────────────────────────
// Broadcast relay (client side)
// ───────────────────────────────────────────────────────────────────

/// Publishing half of a document broadcast channel.
///
/// Cheap to clone; clones share the epoch and the sequence counter.
#[derive(Clone)]
pub struct BroadcastSender {
    hub: Arc<ChannelHub>,
    channel: String,
    user_id: UserId,
    epoch: Uuid,
    seq: Arc<AtomicU64>,
}

impl BroadcastSender {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Fire-and-forget send of a raw payload.
    pub async fn send(&self, kind: EventKind, payload: Vec<u8>) -> usize {
        let message = ChannelMessage {
            kind,
            user_id: self.user_id,
            epoch: self.epoch,
            seq: self.next_seq(),
            payload,
        };
        self.publish(message).await
    }

    pub async fn send_edit(&self, edit: &Edit) -> std::result::Result<usize, ProtocolError> {
        let message =
            ChannelMessage::content_update(self.user_id, self.next_seq(), edit)?.with_epoch(self.epoch);
        Ok(self.publish(message).await)
    }

    pub async fn send_cursor(
        &self,
        cursor: &CursorPosition,
    ) -> std::result::Result<usize, ProtocolError> {
        let message =
            ChannelMessage::cursor_update(self.user_id, self.next_seq(), cursor)?.with_epoch(self.epoch);
        Ok(self.publish(message).await)
    }

    async fn publish(&self, message: ChannelMessage) -> usize {
        let kind = message.kind;
        let delivered = self
            .hub
            .publish(&self.channel, HubEvent::Message(Arc::new(message)))
            .await;
        log::trace!("{} on '{}' reached {} subscriber(s)", kind.as_str(), self.channel, delivered);
        delivered
    }
}

/// Per-document pub/sub handle of one client.
///
/// Messages published under the local user id are never yielded back.
pub struct BroadcastRelay {
    sender: BroadcastSender,
    subscription: Subscription,
}

impl BroadcastRelay {
    /// Subscribe to `document:{id}` as `user_id`.
    pub async fn connect(
        hub: Arc<ChannelHub>,
        document_id: DocumentId,
        user_id: UserId,
    ) -> Result<Self> {
        let sender = hub.sender(document_id, user_id);
        let subscription = hub.subscribe(sender.channel()).await?;
        log::debug!("User {user_id} connected to '{}'", sender.channel());
        Ok(Self {
            sender,
            subscription,
        })
    }

    /// A publishing handle sharing this relay's sequence counter.
    pub fn sender(&self) -> BroadcastSender {
        self.sender.clone()
    }

    pub async fn send(&self, kind: EventKind, payload: Vec<u8>) -> usize {
        self.sender.send(kind, payload).await
    }

    /// Next message from another user, in receipt order.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let event = self.subscription.recv().await?;
            if let Some(message) = self.accept(event) {
                return Some(message);
            }
        }
    }

    /// Next buffered message from another user, without waiting.
    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let event = self.subscription.try_recv()?;
            if let Some(message) = self.accept(event) {
                return Some(message);
            }
        }
    }

    /// All buffered messages from other users.
    pub fn drain(&mut self) -> Vec<ChannelMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn accept(&self, event: HubEvent) -> Option<ChannelMessage> {
        match event {
            HubEvent::Message(message) if message.user_id != self.sender.user_id => {
                Some(Arc::unwrap_or_clone(message))
            }
            _ => None,
        }
    }
}
