use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use kvdesk_core::types::{ChannelId, Timestamp};
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// A live WebSocket connection.
pub struct WsConnection {
    pub sender: WsSender,
    pub connected_at: Timestamp,
}

/// All live WebSocket connections, keyed by channel id.
///
/// Wrap in `Arc` and share; the map is guarded by an interior `RwLock`.
pub struct WsManager {
    connections: RwLock<HashMap<ChannelId, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection and return the receiver its writer task drains.
    pub async fn add(&self, channel_id: ChannelId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(channel_id, conn);
        rx
    }

    pub async fn remove(&self, channel_id: &str) {
        if let Some(conn) = self.connections.write().await.remove(channel_id) {
            let lifetime = chrono::Utc::now() - conn.connected_at;
            tracing::debug!(
                channel_id,
                lifetime_secs = lifetime.num_seconds(),
                "WebSocket connection removed",
            );
        }
    }

    pub async fn contains(&self, channel_id: &str) -> bool {
        self.connections.read().await.contains_key(channel_id)
    }

    /// Queue a message for one connection.
    ///
    /// Returns `false` when no such connection exists or its writer has
    /// already gone away.
    pub async fn send_to(&self, channel_id: &str, message: Message) -> bool {
        match self.connections.read().await.get(channel_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Serialize `value` and queue it as a text frame.
    pub async fn send_json(&self, channel_id: &str, value: &serde_json::Value) -> bool {
        self.send_to(channel_id, Message::Text(value.to_string().into()))
            .await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Send a Close frame to every connection, then forget them all.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connection.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
