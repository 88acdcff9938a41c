//! Outbound handle for one WebSocket peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bob_core::Event;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A connected worker or client.
///
/// The only way to write to the socket is [`Connection::send`], which queues
/// the frame for the connection's writer task. [`Connection::close`] ends the
/// session driving the socket.
pub struct Connection {
    /// Unique connection ID.
    pub id: String,
    /// Send channel to the WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Whether the peer has shown activity since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// Cancelled to end this connection's session.
    closed: CancellationToken,
    /// Count of messages dropped due to a full or closed channel.
    pub dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection with a fresh ID.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self::with_id(uuid::Uuid::now_v7().to_string(), tx)
    }

    /// Create a connection with a given ID.
    pub fn with_id(id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            is_alive: AtomicBool::new(true),
            closed: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Tie the session to `parent`: cancelling it also closes this connection.
    #[must_use]
    pub fn child_of(mut self, parent: &CancellationToken) -> Self {
        self.closed = parent.child_token();
        self
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Encode and queue an event.
    pub fn send_event(&self, event: &Event) -> bool {
        match event.encode() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, event = %event.name, error = %e, "failed to encode event");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// End the session driving this socket. Idempotent.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(conn_id = %self.id, "closing connection");
        }
        self.closed.cancel();
    }

    /// Token cancelled once the connection is closed.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Whether [`close`](Self::close) was called (or the parent cancelled).
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dropped", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (Connection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (Connection::with_id("conn_1".into(), tx), rx)
    }

    #[test]
    fn new_connections_get_distinct_ids() {
        let (tx, _rx) = mpsc::channel(1);
        let a = Connection::new(tx.clone());
        let b = Connection::new(tx);
        assert_ne!(a.id, b.id);
        assert!(a.is_alive.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn send_event_encodes_json() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_event(&Event::new("ability.start").with_ability("Hearing")));
        let msg = rx.recv().await.unwrap();
        let parsed = Event::decode(&msg).unwrap();
        assert_eq!(parsed.name, "ability.start");
        assert_eq!(parsed.ability_name.as_deref(), Some("Hearing"));
    }

    #[tokio::test]
    async fn send_to_closed_channel_counts_drop() {
        let (tx, rx) = mpsc::channel(32);
        let conn = Connection::with_id("conn_2".into(), tx);
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_full_channel_returns_false() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::with_id("conn_3".into(), tx);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn check_alive_resets_flag() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn close_cancels_own_token_only() {
        let root = CancellationToken::new();
        let (a, _rx_a) = make_connection();
        let a = a.child_of(&root);
        let (b, _rx_b) = make_connection();
        let b = b.child_of(&root);

        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert!(!root.is_cancelled());

        root.cancel();
        assert!(b.closed().is_cancelled());
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (conn, mut rx) = make_connection();
        for i in 0..5 {
            assert!(conn.send(Arc::new(format!("msg_{i}"))));
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap(), &format!("msg_{i}"));
        }
    }
}
