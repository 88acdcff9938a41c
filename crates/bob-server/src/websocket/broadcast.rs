//! Event fan-out to connected clients.

use std::collections::HashMap;
use std::sync::Arc;

use bob_core::Event;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::Connection;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;

/// Set of connected clients.
///
/// The lock is synchronous so dispatcher listeners can broadcast without an
/// async context; it is only held while cloning the recipient list.
pub struct BroadcastManager {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl BroadcastManager {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection.
    pub fn add(&self, connection: Arc<Connection>) {
        let _ = self
            .connections
            .write()
            .insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub fn remove(&self, connection_id: &str) {
        let _ = self.connections.write().remove(connection_id);
    }

    /// Send `event` to every client. Returns the number of successful sends.
    ///
    /// The event is encoded once. A failed send is logged and counted; the
    /// recipient stays registered until its own session ends.
    pub fn broadcast_all(&self, event: &Event) -> usize {
        let json = match event.encode() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event = %event.name, error = %e, "failed to serialize event");
                return 0;
            }
        };
        let recipients: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        debug!(event = %event.name, recipients = recipients.len(), "broadcast event to all");

        let mut delivered = 0;
        for conn in recipients {
            if conn.send(Arc::clone(&json)) {
                delivered += 1;
            } else {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(conn_id = %conn.id, event = %event.name, "failed to send event to client");
            }
        }
        delivered
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}

impl Default for BroadcastManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastManager")
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_connection(id: &str, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::with_id(id.into(), tx)), rx)
    }

    #[test]
    fn add_and_remove() {
        let bm = BroadcastManager::new();
        let (c1, _rx1) = make_connection("c1", 4);
        let (c2, _rx2) = make_connection("c2", 4);
        bm.add(c1);
        bm.add(c2);
        assert_eq!(bm.connection_count(), 2);
        bm.remove("c1");
        assert_eq!(bm.connection_count(), 1);
        bm.remove("missing");
        assert_eq!(bm.connection_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let bm = BroadcastManager::new();
        let (c1, mut rx1) = make_connection("c1", 4);
        let (c2, mut rx2) = make_connection("c2", 4);
        bm.add(c1);
        bm.add(c2);

        let sent = bm.broadcast_all(&Event::new("worker.registered").with_worker("Brain"));
        assert_eq!(sent, 2);
        for rx in [&mut rx1, &mut rx2] {
            let event = Event::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(event.name, "worker.registered");
            assert_eq!(event.worker_name.as_deref(), Some("Brain"));
        }
    }

    #[tokio::test]
    async fn failed_recipient_does_not_block_others() {
        let bm = BroadcastManager::new();
        let (full, _full_rx) = make_connection("full", 1);
        assert!(full.send(Arc::new("filler".into())));
        let (closed, closed_rx) = make_connection("closed", 4);
        drop(closed_rx);
        let (ok, mut ok_rx) = make_connection("ok", 4);
        bm.add(Arc::clone(&full));
        bm.add(Arc::clone(&closed));
        bm.add(ok);

        let sent = bm.broadcast_all(&Event::new("samples"));
        assert_eq!(sent, 1);
        assert!(ok_rx.recv().await.is_some());
        assert_eq!(full.drop_count(), 1);
        assert_eq!(closed.drop_count(), 1);
        assert_eq!(bm.connection_count(), 3);
    }

    #[test]
    fn broadcast_with_no_clients() {
        let bm = BroadcastManager::default();
        assert_eq!(bm.broadcast_all(&Event::new("samples")), 0);
    }
}
