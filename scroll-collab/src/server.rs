//! WebSocket relay server in front of a [`ChannelHub`].
//!
//! Architecture:
//! ```text
//! Client A ──┐  ClientFrame (bincode)            ┌── "document:{id}" ──┐
//!             ├────────────────────► ChannelHub ─┤                     ├──► Client B
//! Client C ──┘  ◄──────────────────              └── "presence:{id}" ──┘
//!                 ServerFrame (bincode)
//! ```
//!
//! Each connection owns:
//! - one forwarding task per subscribed channel, feeding an outbound queue;
//! - the set of user ids it published or joined as (their own messages
//!   are not echoed back);
//! - the presence rooms it joined, left automatically on disconnect.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 8

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ChannelHub, HubConfig, HubEvent, Subscription};
use crate::model::{DocumentId, UserId};
use crate::protocol::{ClientFrame, ServerFrame};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per channel and outbound queue size
    pub channel_capacity: usize,
    /// Presence entries without a heartbeat for this long are dropped
    pub presence_idle_timeout_secs: u64,
    /// How often idle presence is swept
    pub sweep_interval_secs: u64,
    /// Maximum channel subscriptions per connection
    pub max_subscriptions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
            presence_idle_timeout_secs: 60,
            sweep_interval_secs: 15,
            max_subscriptions: 64,
        }
    }
}

impl ServerConfig {
    fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel_capacity: self.channel_capacity,
            presence_idle_timeout: Duration::from_secs(self.presence_idle_timeout_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

/// Per-connection bookkeeping.
#[derive(Default)]
struct Connection {
    subscriptions: HashMap<String, JoinHandle<()>>,
    joined: HashSet<(DocumentId, UserId)>,
    users: HashSet<UserId>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<ChannelHub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(ChannelHub::new(config.hub_config()));
        Self::with_hub(config, hub)
    }

    /// Serve an existing hub (shared with in-process clients).
    pub fn with_hub(config: ServerConfig, hub: Arc<ChannelHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn hub(&self) -> &Arc<ChannelHub> {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_channels = self.hub.channel_count().await;
        stats
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept WebSocket connections on `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        let sweeper = self
            .hub
            .spawn_presence_sweeper(Duration::from_secs(self.config.sweep_interval_secs.max(1)));

        let result: Result<(), BoxError> = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Close the hub; connected clients see their channels end.
    pub async fn shutdown(&self) {
        self.hub.shutdown().await;
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<ChannelHub>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection::default();
        let result = Self::serve_socket(ws_stream, &hub, &stats, &config, &mut conn).await;

        // Cleanup on disconnect, however the socket ended
        for (channel, task) in conn.subscriptions.drain() {
            task.abort();
            // Let the aborted task drop its receiver before pruning.
            let _ = task.await;
            hub.remove_if_empty(&channel).await;
        }
        for (document_id, user_id) in conn.joined.drain() {
            hub.leave_presence(document_id, user_id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection from {addr} closed");
        result
    }

    async fn serve_socket(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        hub: &Arc<ChannelHub>,
        stats: &Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
        conn: &mut Connection,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(config.channel_capacity.max(1));

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let reply = match ClientFrame::decode(&bytes) {
                                Ok(frame) => Self::handle_frame(frame, hub, config, conn, &out_tx).await,
                                Err(e) => {
                                    log::warn!("Undecodable frame: {e}");
                                    Some(ServerFrame::Error { reason: e.to_string() })
                                }
                            };
                            if let Some(reply) = reply {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            ws_sender.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outbound traffic from subscribed channels
                Some(frame) = out_rx.recv() => {
                    if let ServerFrame::Message { message, .. } = &frame {
                        // Don't echo back to sender
                        if conn.users.contains(&message.user_id) {
                            continue;
                        }
                    }
                    ws_sender.send(Message::Binary(frame.encode()?.into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply one client frame. Returns the direct reply, if any.
    async fn handle_frame(
        frame: ClientFrame,
        hub: &Arc<ChannelHub>,
        config: &ServerConfig,
        conn: &mut Connection,
        out_tx: &mpsc::Sender<ServerFrame>,
    ) -> Option<ServerFrame> {
        match frame {
            ClientFrame::Subscribe { channel } => {
                if conn.subscriptions.contains_key(&channel) {
                    return None;
                }
                if conn.subscriptions.len() >= config.max_subscriptions {
                    return Some(ServerFrame::Error {
                        reason: format!("subscription limit of {} reached", config.max_subscriptions),
                    });
                }
                match hub.subscribe(&channel).await {
                    Ok(subscription) => {
                        let task = tokio::spawn(forward(subscription, out_tx.clone()));
                        conn.subscriptions.insert(channel, task);
                        None
                    }
                    Err(e) => Some(ServerFrame::Error { reason: e.to_string() }),
                }
            }
            ClientFrame::Unsubscribe { channel } => {
                if let Some(task) = conn.subscriptions.remove(&channel) {
                    task.abort();
                    let _ = task.await;
                    hub.remove_if_empty(&channel).await;
                }
                None
            }
            ClientFrame::Publish { channel, message } => {
                conn.users.insert(message.user_id);
                hub.publish(&channel, HubEvent::Message(Arc::new(message))).await;
                None
            }
            ClientFrame::Join { document_id, entry } => {
                let user_id = entry.user_id;
                conn.users.insert(user_id);
                match hub.join_presence(document_id, entry).await {
                    Ok(entries) => {
                        conn.joined.insert((document_id, user_id));
                        // Subscribers already get the sync through the channel.
                        if conn.subscriptions.contains_key(&document_id.presence_channel()) {
                            None
                        } else {
                            Some(ServerFrame::PresenceSync { document_id, entries })
                        }
                    }
                    Err(e) => Some(ServerFrame::Error { reason: e.to_string() }),
                }
            }
            ClientFrame::Leave { document_id, user_id } => {
                conn.joined.remove(&(document_id, user_id));
                hub.leave_presence(document_id, user_id).await;
                None
            }
            ClientFrame::Heartbeat { document_id, user_id } => {
                if hub.heartbeat(document_id, user_id).await {
                    None
                } else {
                    Some(ServerFrame::Error {
                        reason: format!("user {user_id} is not present in {document_id}"),
                    })
                }
            }
            ClientFrame::Ping => Some(ServerFrame::Pong),
        }
    }
}

/// Forward one hub subscription into a connection's outbound queue.
async fn forward(mut subscription: Subscription, out: mpsc::Sender<ServerFrame>) {
    let channel = subscription.channel().to_string();
    while let Some(event) = subscription.recv().await {
        let frame = match event {
            HubEvent::Message(message) => ServerFrame::Message {
                channel: channel.clone(),
                message: Arc::unwrap_or_clone(message),
            },
            HubEvent::PresenceSync { document_id, entries } => ServerFrame::PresenceSync {
                document_id,
                entries: Arc::unwrap_or_clone(entries),
            },
        };
        if out.send(frame).await.is_err() {
            break;
        }
    }
    log::trace!("Forwarder for '{channel}' finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.hub_config().channel_capacity, 256);
        assert_eq!(config.hub_config().presence_idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::new(ServerConfig::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.active_channels, 0);
    }

    #[tokio::test]
    async fn test_server_shares_hub() {
        let hub = Arc::new(ChannelHub::default());
        let server = RelayServer::with_hub(ServerConfig::default(), hub.clone());
        assert!(Arc::ptr_eq(server.hub(), &hub));
    }
}
