//! Socket driver shared by the worker and client channels.
//!
//! Each upgraded socket gets a writer task fed by the connection's queue
//! (plus periodic pings), a heartbeat watching the alive flag, and a read
//! loop handing text frames to the channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bob_settings::WebSocketSettings;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::Connection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer waits to deliver the closing frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer sent a close frame or the stream ended.
    Closed,
    /// Reading or writing the socket failed.
    TransportError,
    /// The peer went silent past the pong timeout.
    TimedOut,
    /// The broker is shutting down or the connection was closed locally.
    Cancelled,
}

/// Drive an upgraded socket until it ends.
///
/// `on_text` runs on this task for every text frame (and every UTF-8 binary
/// frame). Any inbound frame marks the connection alive. Returns once the
/// writer task has finished.
#[allow(clippy::too_many_arguments)]
pub async fn drive<F>(
    channel: &'static str,
    sink: SplitSink<WebSocket, Message>,
    mut stream: SplitStream<WebSocket>,
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<Arc<String>>,
    keepalive: &WebSocketSettings,
    cancel: &CancellationToken,
    mut on_text: F,
) -> SessionEnd
where
    F: FnMut(&str),
{
    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL, "channel" => channel).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE, "channel" => channel).increment(1.0);

    let done = cancel.child_token();
    let write_failed = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        keepalive.ping_interval(),
        done.clone(),
        write_failed.clone(),
    ));

    let heartbeat = run_heartbeat(
        Arc::clone(&connection),
        keepalive.ping_interval(),
        keepalive.pong_timeout(),
        done.clone(),
    );
    tokio::pin!(heartbeat);

    let end = loop {
        tokio::select! {
            biased;
            () = done.cancelled() => break SessionEnd::Cancelled,
            () = write_failed.cancelled() => break SessionEnd::TransportError,
            result = &mut heartbeat => {
                if result == HeartbeatResult::TimedOut {
                    warn!(conn_id = %connection.id, timeout = ?keepalive.pong_timeout(), "peer unresponsive, disconnecting");
                    break SessionEnd::TimedOut;
                }
                break SessionEnd::Cancelled;
            }
            frame = stream.next() => match frame {
                Some(Ok(msg)) => {
                    connection.mark_alive();
                    match msg {
                        Message::Text(text) => on_text(text.as_str()),
                        Message::Binary(data) => match std::str::from_utf8(&data) {
                            Ok(text) => on_text(text),
                            Err(_) => debug!(conn_id = %connection.id, len = data.len(), "dropping non-UTF8 binary frame"),
                        },
                        Message::Close(_) => break SessionEnd::Closed,
                        Message::Ping(_) | Message::Pong(_) => {}
                    }
                }
                Some(Err(e)) => {
                    debug!(conn_id = %connection.id, error = %e, "socket read failed");
                    break SessionEnd::TransportError;
                }
                None => break SessionEnd::Closed,
            },
        }
    };

    done.cancel();
    if let Err(e) = writer.await {
        warn!(conn_id = %connection.id, error = %e, "writer task failed");
    }

    counter!(WS_DISCONNECTIONS_TOTAL, "channel" => channel).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE, "channel" => channel).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS, "channel" => channel)
        .record(started.elapsed().as_secs_f64());
    end
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<String>>,
    ping_interval: Duration,
    done: CancellationToken,
    failed: CancellationToken,
) {
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            () = done.cancelled() => break,
            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                    failed.cancel();
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    failed.cancel();
                    return;
                }
            }
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, sink.send(Message::Close(None))).await;
}
