//! Delivery of outbound messages to connections and feed subscribers.

use crate::protocol::OutboundMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-wide map of client id → outbound queue of the owning connection.
///
/// Each registration carries a connection id so that a late cleanup from a
/// replaced connection cannot remove its successor.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, (Uuid, mpsc::Sender<String>)>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a client id, replacing any previous one.
    ///
    /// Returns the unique connection ID.
    pub async fn register(&self, client_id: String, sender: mpsc::Sender<String>) -> Uuid {
        let connection_id = Uuid::new_v4();
        let previous = self
            .connections
            .write()
            .await
            .insert(client_id.clone(), (connection_id, sender));

        if previous.is_some() {
            tracing::info!(client_id = %client_id, "replaced existing connection registration");
        }
        connection_id
    }

    /// Remove a registration if the connection ID still matches.
    pub async fn deregister(&self, client_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(client_id) {
            Some((current, _)) if *current == connection_id => {
                connections.remove(client_id);
                true
            }
            // Stale removal request or already removed
            _ => false,
        }
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Queue a message for a client. Returns false if nothing was queued.
    pub async fn send(&self, client_id: &str, message_json: String) -> bool {
        let sender = {
            let connections = self.connections.read().await;
            connections.get(client_id).map(|(_, sender)| sender.clone())
        };

        match sender {
            // Awaiting capacity keeps per-session event order intact.
            Some(sender) => sender.send(message_json).await.is_ok(),
            None => false,
        }
    }
}

/// A message together with where it belongs, as seen by feed subscribers.
#[derive(Debug, Clone)]
pub struct RoutedEvent {
    pub session_id: String,
    pub client_id: String,
    pub message: OutboundMessage,
}

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Queued on the owning connection
    pub direct: bool,
    /// Number of feed subscribers that received it
    pub subscribers: usize,
}

/// Routes session output to the owning connection and to feed subscribers.
///
/// Delivery is fire-and-forget: a missing connection is normal (the client
/// may already be gone) and only logged.
#[derive(Clone)]
pub struct EventRouter {
    registry: ConnectionRegistry,
    feed: broadcast::Sender<RoutedEvent>,
}

impl EventRouter {
    pub fn new(registry: ConnectionRegistry, feed_capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Self { registry, feed }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Subscribe to everything routed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RoutedEvent> {
        self.feed.subscribe()
    }

    pub async fn route(&self, session_id: &str, client_id: &str, message: OutboundMessage) -> Delivery {
        let direct = match message.to_json() {
            Some(json) => self.registry.send(client_id, json).await,
            None => false,
        };

        if !direct {
            debug!(
                session_id = %session_id,
                client_id = %client_id,
                kind = message.kind(),
                "no connection for client, message not delivered directly"
            );
        }

        let subscribers = self
            .feed
            .send(RoutedEvent {
                session_id: session_id.to_string(),
                client_id: client_id.to_string(),
                message,
            })
            .unwrap_or(0);

        Delivery { direct, subscribers }
    }

    /// Queue a message for one connection without publishing it to the feed.
    pub async fn send_direct(&self, client_id: &str, message: &OutboundMessage) -> bool {
        let Some(json) = message.to_json() else {
            return false;
        };
        let sent = self.registry.send(client_id, json).await;
        if !sent {
            warn!(client_id = %client_id, kind = message.kind(), "dropping message for missing connection");
        }
        sent
    }
}
