//! Worker-facing channel.
//!
//! A worker dials `/websocket`, sends `worker.register` as its first frame,
//! and from then on streams status and data events. Commands for the worker
//! are queued on its [`Connection`] by the client channel.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use axum::routing::get;
use bob_core::protocol::{
    AbilityStatus, EVENT_PING, EVENT_WORKER_DISCONNECTED, EVENT_WORKER_REGISTER,
    EVENT_WORKER_REGISTERED, Registration, WorkerDisconnected,
};
use bob_core::{Event, ProtocolError};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{
    WORKER_EVENTS_DROPPED_TOTAL, WORKER_EVENTS_TOTAL, WORKER_REGISTRATIONS_REJECTED_TOTAL,
    WORKER_REGISTRATIONS_TOTAL, WORKERS_ACTIVE,
};
use crate::registry::abilities::AbilityRegistry;
use crate::registry::workers::Worker;
use crate::state::AppState;
use crate::websocket::connection::Connection;
use crate::websocket::session::{SessionEnd, drive};

/// Close reasons are limited to 123 bytes by the WebSocket protocol.
const MAX_CLOSE_REASON: usize = 123;

/// Router for the worker listener.
///
/// The timeout bounds the upgrade request only. The session continues on
/// its own task once the handshake response is sent.
pub fn router(state: AppState) -> Router {
    let timeout = state.settings.brains.timeout();
    Router::new()
        .route("/websocket", get(upgrade))
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_worker(socket, state))
}

/// Why a registration handshake failed.
#[derive(Debug)]
enum Rejection {
    Timeout,
    Closed,
    Invalid(ProtocolError),
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Closed => "closed",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Run one worker connection from handshake to cleanup.
#[instrument(skip_all, fields(worker = tracing::field::Empty, conn_id = tracing::field::Empty))]
pub async fn handle_worker(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (key, registration) = match read_registration(&mut stream, &state).await {
        Ok(pair) => pair,
        Err((rejection, declared_name)) => {
            counter!(WORKER_REGISTRATIONS_REJECTED_TOTAL, "reason" => rejection.reason()).increment(1);
            let message = match &rejection {
                Rejection::Invalid(err) => err.to_string(),
                Rejection::Timeout => "registration timed out".to_owned(),
                Rejection::Closed => {
                    debug!("worker left before registering");
                    return;
                }
            };
            warn!(name = ?declared_name, reason = %message, "rejecting worker registration");
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: close_reason(&message).into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, rx) = mpsc::channel(state.settings.websocket.max_send_queue);
    let root = state.shutdown.token();
    let connection = Arc::new(Connection::new(tx).child_of(&root));
    let span = tracing::Span::current();
    let _ = span.record("worker", key.as_str());
    let _ = span.record("conn_id", connection.id.as_str());

    for interface in &registration.interfaces {
        state.interfaces.set(interface.clone());
    }
    let worker = Worker {
        name: registration.name.clone(),
        key: key.clone(),
        abilities: AbilityRegistry::from_declarations(&registration.abilities),
        interfaces: registration.interfaces.clone(),
        connection: Arc::clone(&connection),
    };
    let info = worker.info();
    let outcome = state.workers.register(worker);
    if outcome.replaced {
        info!(name = %registration.name, "worker re-registered, replacing previous connection");
    } else {
        gauge!(WORKERS_ACTIVE).increment(1.0);
    }
    counter!(WORKER_REGISTRATIONS_TOTAL).increment(1);
    info!(
        name = %registration.name,
        abilities = registration.abilities.len(),
        interfaces = registration.interfaces.len(),
        "worker registered"
    );

    match Event::new(EVENT_WORKER_REGISTERED)
        .with_worker(registration.name.clone())
        .with_data(&info)
    {
        Ok(event) => {
            let _ = connection.send_event(&event);
            state.dispatcher.dispatch(&event);
        }
        Err(e) => warn!(error = %e, "failed to encode worker.registered"),
    }

    let end = drive(
        "brains",
        sink,
        stream,
        Arc::clone(&connection),
        rx,
        &state.settings.websocket,
        connection.closed(),
        |text| handle_frame(&state, &key, &connection.id, &registration.name, text),
    )
    .await;

    cleanup(&state, &key, &registration.name, &connection, end);
}

/// Read and validate the first frame.
async fn read_registration(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<(String, Registration), (Rejection, Option<String>)> {
    let deadline = state.settings.brains.register_timeout();
    let text = match tokio::time::timeout(deadline, next_text(stream)).await {
        Err(_) => return Err((Rejection::Timeout, None)),
        Ok(None) => return Err((Rejection::Closed, None)),
        Ok(Some(text)) => text,
    };
    parse_registration(&text).map_err(|(err, name)| (Rejection::Invalid(err), name))
}

/// Decode and validate a `worker.register` frame.
///
/// On failure the declared name, if any, is returned for logging.
pub fn parse_registration(
    text: &str,
) -> Result<(String, Registration), (ProtocolError, Option<String>)> {
    let event = Event::decode(text).map_err(|e| (e, None))?;
    if event.name != EVENT_WORKER_REGISTER {
        return Err((
            ProtocolError::UnexpectedEvent {
                expected: EVENT_WORKER_REGISTER,
                got: event.name,
            },
            None,
        ));
    }
    let registration: Registration = event.payload_as().map_err(|e| (e, None))?;
    let key = registration
        .validate()
        .map_err(|e| (e, Some(registration.name.clone())))?;
    Ok((key, registration))
}

async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => return Some(text.as_str().to_owned()),
            Message::Binary(data) => return Some(String::from_utf8_lossy(&data).into_owned()),
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

fn close_reason(message: &str) -> String {
    if message.len() <= MAX_CLOSE_REASON {
        return message.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_owned()
}

/// Handle one frame from a registered worker.
///
/// Frames are applied only while `connection_id` still owns the entry
/// under `key`.
pub(crate) fn handle_frame(
    state: &AppState,
    key: &str,
    connection_id: &str,
    worker_name: &str,
    text: &str,
) {
    let mut event = match Event::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "dropping malformed worker frame");
            return;
        }
    };

    match event.name.as_str() {
        EVENT_PING => return,
        EVENT_WORKER_REGISTER => {
            warn!("ignoring repeated worker.register");
            return;
        }
        _ => {}
    }

    let Some(ability) = event.ability_name.clone() else {
        counter!(WORKER_EVENTS_DROPPED_TOTAL).increment(1);
        warn!(event = %event.name, "dropping worker event without abilityName");
        return;
    };

    let known = match AbilityStatus::from_event_name(&event.name) {
        Some(status) => {
            let updated = state
                .workers
                .set_ability_state(key, connection_id, &ability, status);
            if updated {
                info!(ability = %ability, status = ?status, "ability status changed");
            }
            updated
        }
        None => state.workers.has_ability(key, connection_id, &ability),
    };
    if !known {
        counter!(WORKER_EVENTS_DROPPED_TOTAL).increment(1);
        warn!(event = %event.name, ability = %ability, "dropping event for unknown ability or replaced connection");
        return;
    }

    event.worker_name = Some(worker_name.to_owned());
    counter!(WORKER_EVENTS_TOTAL).increment(1);
    state.dispatcher.dispatch(&event);
}

/// Single disconnect path for a registered worker.
fn cleanup(state: &AppState, key: &str, name: &str, connection: &Connection, end: SessionEnd) {
    let Some(removed) = state.workers.remove_if_connection(key, &connection.id) else {
        debug!(?end, "replaced connection closed, registry untouched");
        return;
    };
    gauge!(WORKERS_ACTIVE).decrement(1.0);
    info!(?end, dropped = connection.drop_count(), "worker disconnected");

    let payload = WorkerDisconnected {
        name: removed.name,
        key: removed.key,
    };
    match Event::new(EVENT_WORKER_DISCONNECTED)
        .with_worker(name.to_owned())
        .with_data(&payload)
    {
        Ok(event) => state.dispatcher.dispatch(&event),
        Err(e) => warn!(error = %e, "failed to encode worker.disconnected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use bob_core::Dispatcher;
    use bob_core::protocol::{AbilityDeclaration, EVENT_ABILITY_STARTED, EVENT_SAMPLES};
    use bob_settings::BobSettings;
    use parking_lot::Mutex;
    use serde_json::json;
    use tower::ServiceExt;

    fn register_frame(payload: serde_json::Value) -> String {
        Event::new(EVENT_WORKER_REGISTER)
            .with_payload(payload)
            .encode()
            .unwrap()
    }

    fn state_with_worker() -> (AppState, Arc<Mutex<Vec<Event>>>) {
        let state = AppState::new(BobSettings::default());
        let (tx, _rx) = mpsc::channel(4);
        let _ = state.workers.register(Worker {
            name: "Hearing Brain".into(),
            key: "hearing-brain".into(),
            abilities: AbilityRegistry::from_declarations(&[AbilityDeclaration {
                name: "Hearing".into(),
                description: String::new(),
            }]),
            interfaces: Vec::new(),
            connection: Arc::new(Connection::with_id("c1".into(), tx)),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        state.dispatcher.add_listener(Dispatcher::ANY, move |e: &Event| {
            sink.lock().push(e.clone());
            Ok(())
        });
        (state, seen)
    }

    #[test]
    fn parse_valid_registration() {
        let frame = register_frame(json!({
            "name": "Hearing Brain",
            "abilities": [{"name": "Hearing", "description": "Listens"}],
            "interfaces": [{"name": "hearing"}]
        }));
        let (key, reg) = parse_registration(&frame).unwrap();
        assert_eq!(key, "hearing-brain");
        assert_eq!(reg.abilities.len(), 1);
        assert_eq!(reg.interfaces[0].name, "hearing");
    }

    #[test]
    fn parse_rejects_other_first_event() {
        let frame = Event::new("samples").encode().unwrap();
        let (err, _) = parse_registration(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEvent { .. }));
    }

    #[test]
    fn parse_rejects_missing_payload() {
        let frame = Event::new(EVENT_WORKER_REGISTER).encode().unwrap();
        let (err, _) = parse_registration(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingPayload(_)));
    }

    #[test]
    fn parse_rejects_duplicate_abilities_with_name() {
        let frame = register_frame(json!({
            "name": "Brain",
            "abilities": [{"name": "Hearing"}, {"name": "Hearing"}]
        }));
        let (err, name) = parse_registration(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateAbility(_)));
        assert_eq!(name.as_deref(), Some("Brain"));
    }

    #[test]
    fn parse_rejects_garbage() {
        let (err, name) = parse_registration("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
        assert!(name.is_none());
    }

    #[test]
    fn close_reason_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let reason = close_reason(&long);
        assert!(reason.len() <= MAX_CLOSE_REASON);
        assert!(reason.chars().all(|c| c == 'é'));
        assert_eq!(close_reason("short"), "short");
    }

    #[test]
    fn status_event_updates_state_and_redispatches_tagged() {
        let (state, seen) = state_with_worker();
        let frame = Event::new(EVENT_ABILITY_STARTED)
            .with_ability("Hearing")
            .with_worker("spoofed")
            .encode()
            .unwrap();
        handle_frame(&state, "hearing-brain", "c1", "Hearing Brain", &frame);

        let worker = state.workers.lookup("hearing-brain").unwrap();
        assert_eq!(
            worker.abilities.get("Hearing").unwrap().status,
            AbilityStatus::Running
        );
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].worker_name.as_deref(), Some("Hearing Brain"));
    }

    #[test]
    fn data_event_for_known_ability_is_dispatched() {
        let (state, seen) = state_with_worker();
        let frame = Event::new(EVENT_SAMPLES)
            .with_ability("Hearing")
            .with_payload(json!({"samples": [1, 2]}))
            .encode()
            .unwrap();
        handle_frame(&state, "hearing-brain", "c1", "Hearing Brain", &frame);
        assert_eq!(seen.lock()[0].name, EVENT_SAMPLES);
    }

    #[test]
    fn events_for_unknown_or_missing_ability_are_dropped() {
        let (state, seen) = state_with_worker();
        for event in [
            Event::new(EVENT_SAMPLES).with_ability("Seeing"),
            Event::new(EVENT_SAMPLES),
            Event::new(EVENT_ABILITY_STARTED).with_ability("Seeing"),
        ] {
            handle_frame(&state, "hearing-brain", "c1", "Hearing Brain", &event.encode().unwrap());
        }
        handle_frame(&state, "hearing-brain", "c1", "Hearing Brain", "{broken");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn ping_and_repeated_register_are_not_dispatched() {
        let (state, seen) = state_with_worker();
        handle_frame(&state, "hearing-brain", "c1", "Hearing Brain", r#"{"name":"ping"}"#);
        handle_frame(
            &state,
            "hearing-brain",
            "c1",
            "Hearing Brain",
            &register_frame(json!({"name": "Other"})),
        );
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn frames_from_replaced_connection_are_ignored() {
        let (state, seen) = state_with_worker();
        let frame = Event::new(EVENT_ABILITY_STARTED)
            .with_ability("Hearing")
            .encode()
            .unwrap();
        handle_frame(&state, "hearing-brain", "stale", "Hearing Brain", &frame);
        let data = Event::new(EVENT_SAMPLES).with_ability("Hearing");
        handle_frame(&state, "hearing-brain", "stale", "Hearing Brain", &data.encode().unwrap());

        let worker = state.workers.lookup("hearing-brain").unwrap();
        assert_eq!(
            worker.abilities.get("Hearing").unwrap().status,
            AbilityStatus::Stopped
        );
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn router_rejects_plain_get() {
        let state = AppState::new(BobSettings::default());
        let response = router(state)
            .oneshot(Request::get("/websocket").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[test]
    fn cleanup_dispatches_disconnect_once() {
        let (state, seen) = state_with_worker();
        let conn = state.workers.lookup("hearing-brain").unwrap().connection;
        cleanup(&state, "hearing-brain", "Hearing Brain", &conn, SessionEnd::Closed);
        cleanup(&state, "hearing-brain", "Hearing Brain", &conn, SessionEnd::Closed);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name, EVENT_WORKER_DISCONNECTED);
        assert_eq!(seen[0].payload.as_ref().unwrap()["key"], "hearing-brain");
        assert!(state.workers.is_empty());
    }

    #[test]
    fn cleanup_of_replaced_connection_keeps_new_entry() {
        let (state, seen) = state_with_worker();
        let (tx, _rx) = mpsc::channel(1);
        let stale = Connection::with_id("stale".into(), tx);
        cleanup(&state, "hearing-brain", "Hearing Brain", &stale, SessionEnd::Closed);
        assert!(seen.lock().is_empty());
        assert!(state.workers.lookup("hearing-brain").is_some());
    }
}
