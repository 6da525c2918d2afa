//! Client table: routes supervisor events to the connection currently
//! serving each client.
//!
//! Jobs refer to their client by id only. A client that reconnects announces
//! the same id, which re-points the entry at the new connection so events for
//! jobs started before the disconnect keep flowing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use shellvisor_proto::Event;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

/// Identifies one accepted connection, distinct across reconnects.
pub type ConnectionId = u64;

struct ClientEntry {
    connection: ConnectionId,
    tx: mpsc::Sender<Event>,
}

/// Shared map of client id to outbound event sender.
#[derive(Default)]
pub struct ClientTable {
    clients: Arc<RwLock<HashMap<String, ClientEntry>>>,
    next_connection: AtomicU64,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a newly accepted connection.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Point `client_id` at `connection`, replacing any previous connection.
    pub async fn attach(&self, client_id: &str, connection: ConnectionId, tx: mpsc::Sender<Event>) {
        let previous = self
            .clients
            .write()
            .await
            .insert(client_id.to_string(), ClientEntry { connection, tx });
        match previous {
            Some(old) if old.connection != connection => {
                info!(client_id, connection, replaced = old.connection, "Client reattached");
            }
            Some(_) => {}
            None => info!(client_id, connection, "Client attached"),
        }
    }

    /// Remove `client_id` only if it still belongs to `connection`. A newer
    /// connection for the same client keeps its entry.
    pub async fn detach(&self, client_id: &str, connection: ConnectionId) -> bool {
        let mut clients = self.clients.write().await;
        let owned = clients
            .get(client_id)
            .is_some_and(|entry| entry.connection == connection);
        if owned {
            clients.remove(client_id);
            drop(clients);
            info!(client_id, connection, "Client detached");
        }
        owned
    }

    /// Deliver an event to the client's current connection.
    ///
    /// Events for a client with no live connection are dropped.
    pub async fn send(&self, client_id: &str, event: Event) -> bool {
        let tx = self
            .clients
            .read()
            .await
            .get(client_id)
            .map(|entry| entry.tx.clone());

        let Some(tx) = tx else {
            debug!(client_id, action = event.action(), "No connection for client, dropping event");
            return false;
        };
        if tx.send(event).await.is_err() {
            debug!(client_id, "Client connection closed, dropping event");
            return false;
        }
        true
    }

    /// Whether a connection is attached for `client_id`.
    pub async fn is_attached(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    /// Number of attached clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Drop every client entry, closing their outbound queues.
    pub async fn clear(&self) {
        self.clients.write().await.clear();
    }
}
