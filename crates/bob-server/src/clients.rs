//! Client-facing channel: the front-end WebSocket, the event relay, and the
//! read-only `/api` routes.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Json, Response};
use axum::routing::get;
use bob_core::protocol::{
    AbilityCommand, EVENT_ABILITY_START, EVENT_ABILITY_STOP, EVENT_PING,
    EVENT_WORKER_DISCONNECTED, EVENT_WORKER_REGISTERED, Interface, WorkerInfo,
};
use bob_core::{Dispatcher, Event, key};
use futures::StreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{COMMANDS_FORWARDED_TOTAL, COMMANDS_UNROUTED_TOTAL};
use crate::registry::workers::WorkerRegistry;
use crate::state::AppState;
use crate::websocket::broadcast::BroadcastManager;
use crate::websocket::connection::Connection;
use crate::websocket::session::drive;

/// Router for the client listener.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/bob", get(bob_snapshot))
        .route("/bob/stop", get(bob_stop))
        .route("/ok", get(ok))
        .route("/references", get(references))
        .layer(TimeoutLayer::new(state.settings.clients.timeout()));

    Router::new()
        .route("/websocket", get(upgrade))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Register the catch-all listener that relays client-visible events.
pub fn install_relay(dispatcher: &Dispatcher, clients: Arc<BroadcastManager>) {
    dispatcher.add_listener(Dispatcher::ANY, move |event: &Event| {
        if is_client_visible(event) {
            let _ = clients.broadcast_all(event);
        }
        Ok(())
    });
}

/// Worker lifecycle events and anything a worker originated.
pub fn is_client_visible(event: &Event) -> bool {
    matches!(
        event.name.as_str(),
        EVENT_WORKER_REGISTERED | EVENT_WORKER_DISCONNECTED
    ) || event.worker_name.is_some()
}

// ── WebSocket ───────────────────────────────────────────────────────────────

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_client(socket, state))
}

/// Run one client connection until it closes.
#[instrument(skip_all, fields(conn_id = tracing::field::Empty))]
pub async fn handle_client(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.settings.websocket.max_send_queue);
    let connection = Arc::new(Connection::new(tx));
    let _ = tracing::Span::current().record("conn_id", connection.id.as_str());

    state.clients.add(Arc::clone(&connection));
    info!("client connected");

    let root = state.shutdown.token();
    let end = drive(
        "clients",
        sink,
        stream,
        Arc::clone(&connection),
        rx,
        &state.settings.websocket,
        &root,
        |text| handle_frame(&state.workers, text),
    )
    .await;

    state.clients.remove(&connection.id);
    info!(?end, dropped = connection.drop_count(), "client disconnected");
}

/// What happened to a client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRoute {
    /// Queued on the worker's connection.
    Forwarded,
    /// The payload was missing or malformed.
    Invalid,
    /// No worker is registered under the derived key.
    UnknownWorker,
    /// The worker exists but never declared the ability.
    UnknownAbility,
    /// The worker's queue was full or closed.
    SendFailed,
}

impl CommandRoute {
    fn reason(self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Invalid => "invalid",
            Self::UnknownWorker => "unknown_worker",
            Self::UnknownAbility => "unknown_ability",
            Self::SendFailed => "send_failed",
        }
    }
}

fn handle_frame(workers: &WorkerRegistry, text: &str) {
    let event = match Event::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "dropping malformed client frame");
            return;
        }
    };
    match event.name.as_str() {
        EVENT_PING => {}
        EVENT_ABILITY_START | EVENT_ABILITY_STOP => {
            let _ = route_command(workers, &event);
        }
        other => debug!(event = other, "ignoring client event"),
    }
}

/// Resolve an `ability.start` / `ability.stop` command and forward it
/// unchanged to the target worker.
pub fn route_command(workers: &WorkerRegistry, event: &Event) -> CommandRoute {
    let route = resolve_and_send(workers, event);
    if route == CommandRoute::Forwarded {
        counter!(COMMANDS_FORWARDED_TOTAL).increment(1);
    } else {
        counter!(COMMANDS_UNROUTED_TOTAL, "reason" => route.reason()).increment(1);
    }
    route
}

fn resolve_and_send(workers: &WorkerRegistry, event: &Event) -> CommandRoute {
    let command: AbilityCommand = match event.payload_as() {
        Ok(command) => command,
        Err(e) => {
            warn!(event = %event.name, error = %e, "invalid ability command");
            return CommandRoute::Invalid;
        }
    };
    let worker_key = key(&command.worker_name);
    let Some(worker) = workers.lookup(&worker_key) else {
        warn!(worker = %worker_key, "command for unknown worker");
        return CommandRoute::UnknownWorker;
    };
    if !worker.abilities.contains(&command.ability_name) {
        warn!(worker = %worker_key, ability = %command.ability_name, "command for unknown ability");
        return CommandRoute::UnknownAbility;
    }
    if worker.connection.send_event(event) {
        debug!(worker = %worker_key, ability = %command.ability_name, event = %event.name, "forwarded command");
        CommandRoute::Forwarded
    } else {
        warn!(worker = %worker_key, "failed to enqueue command for worker");
        CommandRoute::SendFailed
    }
}

// ── API ─────────────────────────────────────────────────────────────────────

/// `GET /api/bob` response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Registered workers with their abilities.
    pub workers: Vec<WorkerInfo>,
    /// Declared interfaces.
    pub interfaces: Vec<Interface>,
}

/// `GET /api/references` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct References {
    /// URL front-ends dial for the client WebSocket.
    pub ws_url: String,
    /// Keepalive period in seconds.
    pub ws_ping_period: u64,
}

/// Point-in-time view of both registries.
pub fn snapshot(state: &AppState) -> Snapshot {
    Snapshot {
        workers: state.workers.list().iter().map(|w| w.info()).collect(),
        interfaces: state.interfaces.list(),
    }
}

async fn bob_snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(snapshot(&state))
}

async fn bob_stop(State(state): State<AppState>) -> StatusCode {
    info!("stop requested over the API");
    state.shutdown.shutdown();
    StatusCode::NO_CONTENT
}

async fn ok() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn references(State(state): State<AppState>) -> Json<References> {
    Json(References {
        ws_url: format!("ws://{}/websocket", state.settings.clients.advertised_addr()),
        ws_ping_period: state.settings.websocket.ping_interval().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::abilities::AbilityRegistry;
    use crate::registry::workers::Worker;
    use axum::body::Body;
    use axum::http::Request;
    use bob_core::protocol::{AbilityDeclaration, EVENT_BOB_READY, EVENT_SAMPLES};
    use bob_settings::BobSettings;
    use serde_json::json;
    use tower::ServiceExt;

    fn add_worker(state: &AppState, name: &str, capacity: usize) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(capacity);
        let _ = state.workers.register(Worker {
            name: name.into(),
            key: key(name),
            abilities: AbilityRegistry::from_declarations(&[AbilityDeclaration {
                name: "Hearing".into(),
                description: "Listens".into(),
            }]),
            interfaces: Vec::new(),
            connection: Arc::new(Connection::with_id(format!("conn-{name}"), tx)),
        });
        rx
    }

    fn command(name: &str, worker: &str, ability: &str) -> Event {
        Event::new(name).with_payload(json!({"workerName": worker, "abilityName": ability}))
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    #[test]
    fn visibility_rules() {
        assert!(is_client_visible(&Event::new(EVENT_WORKER_REGISTERED)));
        assert!(is_client_visible(&Event::new(EVENT_WORKER_DISCONNECTED)));
        assert!(is_client_visible(&Event::new(EVENT_SAMPLES).with_worker("Brain")));
        assert!(!is_client_visible(&Event::new(EVENT_SAMPLES)));
        assert!(!is_client_visible(&Event::new(EVENT_BOB_READY)));
    }

    #[tokio::test]
    async fn start_command_is_forwarded_verbatim() {
        let state = AppState::new(BobSettings::default());
        let mut rx = add_worker(&state, "Hearing Brain", 4);
        let cmd = command(EVENT_ABILITY_START, "Hearing Brain", "Hearing");
        assert_eq!(route_command(&state.workers, &cmd), CommandRoute::Forwarded);
        let forwarded = Event::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(forwarded, cmd);
    }

    #[test]
    fn command_resolves_worker_by_key() {
        let state = AppState::new(BobSettings::default());
        let _rx = add_worker(&state, "Hearing Brain", 4);
        let cmd = command(EVENT_ABILITY_STOP, "HEARING.brain", "Hearing");
        assert_eq!(route_command(&state.workers, &cmd), CommandRoute::Forwarded);
    }

    #[test]
    fn unknown_targets_are_dropped() {
        let state = AppState::new(BobSettings::default());
        let _rx = add_worker(&state, "Brain", 4);
        assert_eq!(
            route_command(&state.workers, &command(EVENT_ABILITY_START, "Ghost", "Hearing")),
            CommandRoute::UnknownWorker
        );
        assert_eq!(
            route_command(&state.workers, &command(EVENT_ABILITY_START, "Brain", "Seeing")),
            CommandRoute::UnknownAbility
        );
        assert_eq!(
            route_command(&state.workers, &Event::new(EVENT_ABILITY_START)),
            CommandRoute::Invalid
        );
    }

    #[test]
    fn full_worker_queue_reports_send_failure() {
        let state = AppState::new(BobSettings::default());
        let _rx = add_worker(&state, "Brain", 1);
        let cmd = command(EVENT_ABILITY_START, "Brain", "Hearing");
        assert_eq!(route_command(&state.workers, &cmd), CommandRoute::Forwarded);
        assert_eq!(route_command(&state.workers, &cmd), CommandRoute::SendFailed);
    }

    #[tokio::test]
    async fn relay_broadcasts_only_visible_events() {
        let state = AppState::new(BobSettings::default());
        install_relay(&state.dispatcher, Arc::clone(&state.clients));
        let (tx, mut rx) = mpsc::channel(8);
        state.clients.add(Arc::new(Connection::with_id("client".into(), tx)));

        state.dispatcher.dispatch(&Event::new(EVENT_BOB_READY));
        state
            .dispatcher
            .dispatch(&Event::new(EVENT_SAMPLES).with_worker("Brain").with_ability("Hearing"));

        let relayed = Event::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(relayed.name, EVENT_SAMPLES);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn api_ok_returns_no_content() {
        let state = AppState::new(BobSettings::default());
        let (status, _) = get_json(&state, "/api/ok").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn api_snapshot_lists_workers_and_interfaces() {
        let state = AppState::new(BobSettings::default());
        let _rx = add_worker(&state, "Hearing Brain", 4);
        state.interfaces.set(Interface::new("hearing"));

        let (status, body) = get_json(&state, "/api/bob").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["workers"][0]["key"], "hearing-brain");
        assert_eq!(body["workers"][0]["abilities"][0]["name"], "Hearing");
        assert_eq!(body["workers"][0]["abilities"][0]["status"], "stopped");
        assert_eq!(body["interfaces"][0]["name"], "hearing");
    }

    #[tokio::test]
    async fn api_stop_triggers_shutdown() {
        let state = AppState::new(BobSettings::default());
        let (status, _) = get_json(&state, "/api/bob/stop").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.shutdown.is_shutting_down());
    }

    #[tokio::test]
    async fn api_references_use_public_addr() {
        let mut settings = BobSettings::default();
        settings.clients.public_addr = Some("bob.lan:8080".into());
        settings.websocket.ping_interval_ms = 54_000;
        let state = AppState::new(settings);
        let (status, body) = get_json(&state, "/api/references").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["wsUrl"], "ws://bob.lan:8080/websocket");
        assert_eq!(body["wsPingPeriod"], 54);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let state = AppState::new(BobSettings::default());
        let (status, _) = get_json(&state, "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
