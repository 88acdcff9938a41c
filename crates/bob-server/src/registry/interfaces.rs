//! Declared interfaces, keyed by name.

use std::collections::HashMap;

use bob_core::protocol::Interface;
use parking_lot::RwLock;

/// Name-keyed interface declarations. Last write wins.
#[derive(Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<String, Interface>>,
}

impl InterfaceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite by name.
    pub fn set(&self, interface: Interface) {
        let _ = self
            .interfaces
            .write()
            .insert(interface.name.clone(), interface);
    }

    /// All declared interfaces, sorted by name.
    pub fn list(&self) -> Vec<Interface> {
        let mut all: Vec<Interface> = self.interfaces.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Number of declared interfaces.
    pub fn len(&self) -> usize {
        self.interfaces.read().len()
    }

    /// Whether nothing has been declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("count", &self.len())
            .finish()
    }
}
