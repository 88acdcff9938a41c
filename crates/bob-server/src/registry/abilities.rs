//! Per-worker ability table.

use bob_core::protocol::{AbilityDeclaration, AbilityInfo, AbilityStatus};

/// Abilities of one worker, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AbilityRegistry {
    entries: Vec<AbilityInfo>,
}

impl AbilityRegistry {
    /// Build from a validated registration. Every ability starts `Stopped`.
    pub fn from_declarations(declarations: &[AbilityDeclaration]) -> Self {
        Self {
            entries: declarations
                .iter()
                .map(|d| AbilityInfo {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    status: AbilityStatus::Stopped,
                })
                .collect(),
        }
    }

    /// Look up an ability by name.
    pub fn get(&self, name: &str) -> Option<&AbilityInfo> {
        self.entries.iter().find(|a| a.name == name)
    }

    /// Whether `name` was declared.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Record a status reported by the worker. Returns `false` for an
    /// undeclared ability.
    pub fn set_status(&mut self, name: &str, status: AbilityStatus) -> bool {
        match self.entries.iter_mut().find(|a| a.name == name) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// Copy of all entries.
    pub fn list(&self) -> Vec<AbilityInfo> {
        self.entries.clone()
    }

    /// Number of declared abilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the worker declared no abilities.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
