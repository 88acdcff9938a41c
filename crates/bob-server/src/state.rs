//! Shared broker state handed to both channels.

use std::sync::Arc;

use bob_core::Dispatcher;
use bob_settings::BobSettings;

use crate::registry::interfaces::InterfaceRegistry;
use crate::registry::workers::WorkerRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::BroadcastManager;

/// Everything a connection handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Event bus.
    pub dispatcher: Arc<Dispatcher>,
    /// Registered workers.
    pub workers: Arc<WorkerRegistry>,
    /// Declared interfaces.
    pub interfaces: Arc<InterfaceRegistry>,
    /// Connected clients.
    pub clients: Arc<BroadcastManager>,
    /// Root cancellation.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Effective configuration.
    pub settings: Arc<BobSettings>,
}

impl AppState {
    /// Fresh state with empty registries.
    pub fn new(settings: BobSettings) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new()),
            workers: Arc::new(WorkerRegistry::new()),
            interfaces: Arc::new(InterfaceRegistry::new()),
            clients: Arc::new(BroadcastManager::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            settings: Arc::new(settings),
        }
    }
}
