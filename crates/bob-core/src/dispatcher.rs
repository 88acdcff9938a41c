//! In-process publish/subscribe bus keyed by event name.
//!
//! Listeners run synchronously on the dispatching task in registration order.
//! Listeners for [`Dispatcher::ANY`] run after the ones registered for the
//! event's own name. A failing or panicking listener is logged and skipped.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::ListenerError;
use crate::protocol::Event;

/// A registered event handler.
pub type Listener = Arc<dyn Fn(&Event) -> Result<(), ListenerError> + Send + Sync>;

/// Name-keyed event bus.
#[derive(Default)]
pub struct Dispatcher {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl Dispatcher {
    /// Listener name that receives every event.
    pub const ANY: &'static str = "*";

    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events named `name`.
    pub fn add_listener<F>(&self, name: impl Into<String>, listener: F)
    where
        F: Fn(&Event) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(name.into())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Deliver `event` to every listener registered for its name, then to
    /// every catch-all listener.
    ///
    /// The listener set is copied before any handler runs, so handlers may
    /// register listeners or dispatch further events.
    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<Listener> = {
            let map = self.listeners.read();
            let named = map.get(&event.name).into_iter().flatten();
            let any = if event.name == Self::ANY {
                None
            } else {
                map.get(Self::ANY)
            };
            named.chain(any.into_iter().flatten()).cloned().collect()
        };

        if snapshot.is_empty() {
            debug!(event = %event.name, "no listeners");
            return;
        }

        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = %event.name, error = %err, "listener failed");
                }
                Err(_) => {
                    warn!(event = %event.name, "listener panicked");
                }
            }
        }
    }

    /// Number of listeners registered for exactly `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.read().get(name).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.listeners.read();
        f.debug_struct("Dispatcher")
            .field("names", &map.len())
            .field("listeners", &map.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}
