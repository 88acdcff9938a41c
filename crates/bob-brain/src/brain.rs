//! Worker runtime: registers with the broker, executes ability commands and
//! relays ability events back over the socket.

use std::sync::Arc;
use std::time::Duration;

use bob_core::protocol::{
    AbilityCommand, EVENT_ABILITY_START, EVENT_ABILITY_STOP, EVENT_PING, EVENT_WORKER_REGISTER,
    EVENT_WORKER_REGISTERED, Interface, Registration, WorkerInfo,
};
use bob_core::{Dispatcher, Event, ListenerError};
use bob_settings::WebSocketSettings;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ability::{Ability, AbilityRunner};
use crate::errors::BrainError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Outbound = Arc<Mutex<Option<mpsc::Sender<String>>>>;
type CommandQueue = mpsc::UnboundedSender<(Command, Arc<AbilityRunner>)>;

/// Worker socket URL of a broker listening on `addr`.
pub fn broker_url(addr: &str) -> String {
    format!("ws://{addr}/websocket")
}

#[derive(Clone, Copy, Debug)]
enum Command {
    Start,
    Stop,
}

enum Exit {
    Cancelled,
    Closed,
    ReadFailed(BrainError),
    WriteFailed,
}

/// A worker process: a name, its abilities, and one broker connection at a
/// time.
pub struct Brain {
    name: String,
    dispatcher: Arc<Dispatcher>,
    runners: Vec<Arc<AbilityRunner>>,
    interfaces: Vec<Interface>,
    ping_interval: Duration,
    queue_capacity: usize,
    outbound: Outbound,
}

impl Brain {
    /// Worker called `name` with no abilities.
    pub fn new(name: impl Into<String>) -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let outbound: Outbound = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outbound);
        dispatcher.add_listener(Dispatcher::ANY, move |event: &Event| forward(&slot, event));

        let keepalive = WebSocketSettings::default();
        Self {
            name: name.into(),
            dispatcher,
            runners: Vec::new(),
            interfaces: Vec::new(),
            ping_interval: keepalive.ping_interval(),
            queue_capacity: keepalive.max_send_queue,
            outbound,
        }
    }

    /// Take the keepalive period and send queue size from `settings`.
    #[must_use]
    pub fn with_keepalive(mut self, settings: &WebSocketSettings) -> Self {
        self.ping_interval = settings.ping_interval();
        self.queue_capacity = settings.max_send_queue;
        self
    }

    /// Expose `ability`.
    #[must_use]
    pub fn with_ability<A: Ability>(mut self, ability: A) -> Self {
        let runner = AbilityRunner::new(ability, Arc::clone(&self.dispatcher));
        self.runners.push(Arc::new(runner));
        self
    }

    /// Advertise `interface`.
    #[must_use]
    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local event bus. Ability-tagged events on it reach the broker.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runner for the ability called `name`.
    pub fn runner(&self, name: &str) -> Option<&Arc<AbilityRunner>> {
        self.runners.iter().find(|r| r.name() == name)
    }

    /// The `worker.register` payload.
    pub fn registration(&self) -> Registration {
        Registration {
            name: self.name.clone(),
            abilities: self.runners.iter().map(|r| r.declaration()).collect(),
            interfaces: self.interfaces.clone(),
        }
    }

    /// Register at `url` and serve commands until the socket closes or
    /// `cancel` fires. Every ability is stopped before this returns.
    pub async fn run(&self, url: &str, cancel: CancellationToken) -> Result<(), BrainError> {
        let (ws, _) = connect_async(url).await.map_err(|e| BrainError::Connect {
            url: url.to_owned(),
            source: Box::new(e),
        })?;
        let (mut sink, mut stream) = ws.split();

        let register = Event::new(EVENT_WORKER_REGISTER).with_data(&self.registration())?;
        sink.send(Message::text(register.encode()?)).await?;
        let Some(key) = await_registered(&mut stream, &cancel).await? else {
            let _ = sink.send(Message::Close(None)).await;
            return Ok(());
        };
        info!(worker = %key, url, abilities = self.runners.len(), "registered with broker");

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        *self.outbound.lock() = Some(tx);
        let write_failed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(sink, rx, self.ping_interval, write_failed.clone()));

        let (commands, queue) = mpsc::unbounded_channel();
        let control = tokio::spawn(control_loop(queue));

        let exit = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Exit::Cancelled,
                () = write_failed.cancelled() => break Exit::WriteFailed,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str(), &commands),
                    Some(Ok(Message::Close(frame))) => {
                        info!(worker = %key, reason = ?frame.map(|f| f.reason.as_str().to_owned()), "broker closed the connection");
                        break Exit::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::ReadFailed(e.into()),
                    None => break Exit::Closed,
                },
            }
        };

        drop(commands);
        if let Err(e) = control.await {
            warn!(worker = %key, error = %e, "command task failed");
        }
        for runner in &self.runners {
            runner.stop().await;
        }
        // Closing the queue lets the writer flush and send the closing frame
        drop(self.outbound.lock().take());
        let written = writer.await;

        match exit {
            Exit::Cancelled | Exit::Closed => Ok(()),
            Exit::ReadFailed(e) => Err(e),
            Exit::WriteFailed => match written {
                Ok(Err(e)) => Err(e.into()),
                _ => Ok(()),
            },
        }
    }

    fn handle_frame(&self, text: &str, commands: &CommandQueue) {
        let event = match Event::decode(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return;
            }
        };
        let command = match event.name.as_str() {
            EVENT_ABILITY_START => Command::Start,
            EVENT_ABILITY_STOP => Command::Stop,
            other => {
                debug!(event = other, "ignoring event");
                return;
            }
        };
        let ability = match event.payload_as::<AbilityCommand>() {
            Ok(cmd) => cmd.ability_name,
            Err(_) => match event.ability_name {
                Some(name) => name,
                None => {
                    warn!(event = %event.name, "command names no ability");
                    return;
                }
            },
        };
        let Some(runner) = self.runner(&ability) else {
            warn!(ability = %ability, "command for unknown ability");
            return;
        };
        debug!(ability = %ability, command = ?command, "command received");
        if commands.send((command, Arc::clone(runner))).is_err() {
            warn!(ability = %ability, "command queue closed");
        }
    }
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("name", &self.name)
            .field("abilities", &self.runners.len())
            .field("interfaces", &self.interfaces.len())
            .field("connected", &self.outbound.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Relay an ability-tagged event to the broker, if connected.
fn forward(slot: &Mutex<Option<mpsc::Sender<String>>>, event: &Event) -> Result<(), ListenerError> {
    if event.ability_name.is_none() {
        return Ok(());
    }
    let Some(tx) = slot.lock().clone() else {
        debug!(event = %event.name, "not connected, dropping event");
        return Ok(());
    };
    let text = event.encode()?;
    tx.try_send(text)
        .map_err(|e| ListenerError::new(format!("outbound queue: {e}")))
}

async fn await_registered(
    stream: &mut SplitStream<WsStream>,
    cancel: &CancellationToken,
) -> Result<Option<String>, BrainError> {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                let event = Event::decode(text.as_str())?;
                if event.name == EVENT_WORKER_REGISTERED {
                    let info: WorkerInfo = event.payload_as()?;
                    return Ok(Some(info.key));
                }
                debug!(event = %event.name, "ignoring event before acknowledgement");
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map_or_else(
                    || "closed without reason".to_owned(),
                    |f| f.reason.as_str().to_owned(),
                );
                return Err(BrainError::Handshake(reason));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(BrainError::Handshake(
                    "connection closed before acknowledgement".to_owned(),
                ));
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
    failed: CancellationToken,
) -> Result<(), tungstenite::Error> {
    let ping_text = Event::new(EVENT_PING).encode().unwrap_or_default();
    let mut ping = tokio::time::interval(ping_interval);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        let text = tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => text,
                None => break,
            },
            _ = ping.tick() => ping_text.clone(),
        };
        if let Err(e) = sink.send(Message::text(text)).await {
            failed.cancel();
            return Err(e);
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

async fn control_loop(mut commands: mpsc::UnboundedReceiver<(Command, Arc<AbilityRunner>)>) {
    while let Some((command, runner)) = commands.recv().await {
        match command {
            Command::Start => {
                if let Err(e) = runner.start().await {
                    warn!(ability = runner.name(), error = %e, "start failed");
                }
            }
            Command::Stop => runner.stop().await,
        }
    }
}
