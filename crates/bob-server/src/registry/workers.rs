//! Registered workers, keyed by normalized name.

use std::collections::HashMap;
use std::sync::Arc;

use bob_core::protocol::{AbilityStatus, Interface, WorkerInfo};
use parking_lot::Mutex;

use super::abilities::AbilityRegistry;
use crate::websocket::connection::Connection;

/// A registered worker.
#[derive(Clone, Debug)]
pub struct Worker {
    /// Display name as declared.
    pub name: String,
    /// Normalized registry key.
    pub key: String,
    /// Declared abilities and their last reported state.
    pub abilities: AbilityRegistry,
    /// Declared interfaces.
    pub interfaces: Vec<Interface>,
    /// Outbound handle to the worker's socket.
    pub connection: Arc<Connection>,
}

impl Worker {
    /// Client-facing view.
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            name: self.name.clone(),
            key: self.key.clone(),
            abilities: self.abilities.list(),
            interfaces: self.interfaces.clone(),
        }
    }
}

/// Result of [`WorkerRegistry::register`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// Key the worker was stored under.
    pub key: String,
    /// Whether an existing entry with the same key was replaced.
    pub replaced: bool,
}

/// Worker table.
///
/// One lock guards the map. It is held only for the map operation;
/// [`list`](Self::list) and [`lookup`](Self::lookup) return copies.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, Worker>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `worker` under its key.
    ///
    /// A replaced entry's connection is closed, ending its session.
    pub fn register(&self, worker: Worker) -> RegisterOutcome {
        let key = worker.key.clone();
        let previous = self.workers.lock().insert(key.clone(), worker);
        if let Some(old) = &previous {
            old.connection.close();
        }
        RegisterOutcome {
            key,
            replaced: previous.is_some(),
        }
    }

    /// Copy of the worker stored under `key`.
    pub fn lookup(&self, key: &str) -> Option<Worker> {
        self.workers.lock().get(key).cloned()
    }

    /// Remove the entry under `key` unconditionally.
    pub fn remove(&self, key: &str) -> Option<Worker> {
        self.workers.lock().remove(key)
    }

    /// Remove the entry under `key` only if it is still owned by
    /// `connection_id`.
    pub fn remove_if_connection(&self, key: &str, connection_id: &str) -> Option<Worker> {
        let mut workers = self.workers.lock();
        if workers.get(key)?.connection.id == connection_id {
            workers.remove(key)
        } else {
            None
        }
    }

    /// Record an ability status reported over `connection_id`.
    ///
    /// Returns `false` if the worker or ability is unknown, or if the entry
    /// now belongs to another connection.
    pub fn set_ability_state(
        &self,
        key: &str,
        connection_id: &str,
        ability: &str,
        status: AbilityStatus,
    ) -> bool {
        self.workers
            .lock()
            .get_mut(key)
            .filter(|w| w.connection.id == connection_id)
            .is_some_and(|w| w.abilities.set_status(ability, status))
    }

    /// Whether the entry under `key` is owned by `connection_id` and has
    /// declared `ability`.
    pub fn has_ability(&self, key: &str, connection_id: &str, ability: &str) -> bool {
        self.workers
            .lock()
            .get(key)
            .filter(|w| w.connection.id == connection_id)
            .is_some_and(|w| w.abilities.contains(ability))
    }

    /// Snapshot of all workers, sorted by key.
    pub fn list(&self) -> Vec<Worker> {
        let mut all: Vec<Worker> = self.workers.lock().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("count", &self.len())
            .finish()
    }
}
