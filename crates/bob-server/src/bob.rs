//! Broker lifecycle: construction, listener setup, run and close.

use std::net::SocketAddr;
use std::sync::Arc;

use bob_core::protocol::{EVENT_BOB_READY, Interface};
use bob_core::{Dispatcher, Event, ListenerError};
use bob_settings::BobSettings;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::BobError;
use crate::registry::interfaces::InterfaceRegistry;
use crate::registry::workers::WorkerRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::state::AppState;
use crate::{brains, clients};

/// The broker.
///
/// Owns the registries, the dispatcher and the root shutdown token, and
/// serves the worker and client listeners.
pub struct Bob {
    state: AppState,
}

impl Bob {
    /// Build a broker with empty registries and the client relay installed.
    pub fn new(settings: BobSettings) -> Self {
        let state = AppState::new(settings);
        clients::install_relay(&state.dispatcher, Arc::clone(&state.clients));
        Self { state }
    }

    /// Declare an interface known to the system.
    pub fn declare(&self, interface: Interface) {
        self.state.interfaces.set(interface);
    }

    /// Subscribe to events named `name` (or [`Dispatcher::ANY`]).
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.state.dispatcher.add_listener(name, handler);
    }

    /// Event bus.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.state.dispatcher
    }

    /// Registered workers.
    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.state.workers
    }

    /// Declared interfaces.
    pub fn interfaces(&self) -> &Arc<InterfaceRegistry> {
        &self.state.interfaces
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Effective configuration.
    pub fn settings(&self) -> &BobSettings {
        &self.state.settings
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Bind both listeners, dispatch `bob.ready`, and serve in the background.
    ///
    /// If either server fails the root token is cancelled so the other one
    /// drains too.
    pub async fn listen(&self) -> Result<Listening, BobError> {
        let settings = &self.state.settings;
        let (brains_listener, brains_addr) = bind("brains", settings.brains.addr()).await?;
        let (clients_listener, clients_addr) = bind("clients", settings.clients.addr()).await?;
        info!(brains = %brains_addr, clients = %clients_addr, "bob listening");

        let token = self.state.shutdown.token();
        let brains = axum::serve(brains_listener, brains::router(self.state.clone()))
            .with_graceful_shutdown(token.clone().cancelled_owned());
        let clients = axum::serve(clients_listener, clients::router(self.state.clone()))
            .with_graceful_shutdown(token.cancelled_owned());

        let shutdown = Arc::clone(&self.state.shutdown);
        let handle = tokio::spawn(async move {
            let (brains_result, clients_result) = tokio::join!(
                async {
                    let result = brains.await;
                    if result.is_err() {
                        shutdown.shutdown();
                    }
                    result
                },
                async {
                    let result = clients.await;
                    if result.is_err() {
                        shutdown.shutdown();
                    }
                    result
                },
            );
            brains_result.map_err(|source| BobError::Serve {
                channel: "brains",
                addr: brains_addr,
                source,
            })?;
            clients_result.map_err(|source| BobError::Serve {
                channel: "clients",
                addr: clients_addr,
                source,
            })?;
            Ok(())
        });

        self.state.dispatcher.dispatch(&Event::new(EVENT_BOB_READY));
        Ok(Listening {
            brains_addr,
            clients_addr,
            handle,
        })
    }

    /// Serve until [`close`](Self::close) is called or a listener fails.
    pub async fn run(&self) -> Result<(), BobError> {
        let result = self.listen().await?.wait().await;
        match &result {
            Ok(()) => info!("bob stopped"),
            Err(e) => error!(error = %e, "bob stopped with error"),
        }
        result
    }

    /// Cancel the root token. Every session and both servers wind down.
    pub fn close(&self) {
        self.state.shutdown.shutdown();
    }
}

impl std::fmt::Debug for Bob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bob")
            .field("workers", &self.state.workers.len())
            .field("interfaces", &self.state.interfaces.len())
            .field("clients", &self.state.clients.connection_count())
            .finish_non_exhaustive()
    }
}

/// Handle to running listeners.
pub struct Listening {
    /// Bound worker listener address.
    pub brains_addr: SocketAddr,
    /// Bound client listener address.
    pub clients_addr: SocketAddr,
    handle: JoinHandle<Result<(), BobError>>,
}

impl Listening {
    /// Wait for both servers to stop.
    pub async fn wait(self) -> Result<(), BobError> {
        self.handle.await?
    }
}

async fn bind(channel: &'static str, addr: String) -> Result<(TcpListener, SocketAddr), BobError> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| BobError::Bind {
            channel,
            addr: addr.clone(),
            source,
        })?;
    let local = listener.local_addr().map_err(|source| BobError::Bind {
        channel,
        addr,
        source,
    })?;
    Ok((listener, local))
}
