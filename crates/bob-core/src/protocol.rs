//! Wire protocol shared by the worker socket, the client socket and the
//! in-process dispatcher.
//!
//! Every frame is one JSON [`Event`]:
//!
//! ```json
//! { "name": "samples", "workerName": "Hearing Brain", "abilityName": "Hearing", "payload": { ... } }
//! ```

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::key::{is_usable, key};

/// Worker → broker: registration handshake, first frame on a worker socket.
pub const EVENT_WORKER_REGISTER: &str = "worker.register";
/// Broker → clients: a worker completed registration.
pub const EVENT_WORKER_REGISTERED: &str = "worker.registered";
/// Broker → clients: a registered worker went away.
pub const EVENT_WORKER_DISCONNECTED: &str = "worker.disconnected";
/// Client → broker → worker: start an ability.
pub const EVENT_ABILITY_START: &str = "ability.start";
/// Client → broker → worker: stop an ability.
pub const EVENT_ABILITY_STOP: &str = "ability.stop";
/// Worker → broker → clients: an ability reached `Running`.
pub const EVENT_ABILITY_STARTED: &str = "ability.started";
/// Worker → broker → clients: an ability returned to `Stopped`.
pub const EVENT_ABILITY_STOPPED: &str = "ability.stopped";
/// Worker → broker → clients: an ability loop failed.
pub const EVENT_ABILITY_CRASHED: &str = "ability.crashed";
/// Worker → broker → clients: a chunk of audio samples.
pub const EVENT_SAMPLES: &str = "samples";
/// Client/worker → broker: keepalive.
pub const EVENT_PING: &str = "ping";
/// In-process only: both broker listeners are bound.
pub const EVENT_BOB_READY: &str = "bob.ready";

/// A named, JSON-serializable event.
///
/// `worker_name` attributes worker-originated events; `ability_name` scopes
/// status and data events to one ability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event name, also the dispatcher routing key.
    pub name: String,
    /// Display name of the originating worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,
    /// Name of the originating or targeted ability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability_name: Option<String>,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Event {
    /// Create an event with no attribution and no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker_name: None,
            ability_name: None,
            payload: None,
        }
    }

    /// Attach a raw JSON payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serialize and attach a typed payload.
    pub fn with_data<T: Serialize>(self, data: &T) -> Result<Self, ProtocolError> {
        Ok(self.with_payload(serde_json::to_value(data)?))
    }

    /// Tag the event with its originating worker.
    #[must_use]
    pub fn with_worker(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self
    }

    /// Tag the event with an ability.
    #[must_use]
    pub fn with_ability(mut self, ability_name: impl Into<String>) -> Self {
        self.ability_name = Some(ability_name.into());
        self
    }

    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as one text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| ProtocolError::MissingPayload(self.name.clone()))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Whether this is an ability status event (started, stopped, crashed).
    pub fn is_ability_status(&self) -> bool {
        matches!(
            self.name.as_str(),
            EVENT_ABILITY_STARTED | EVENT_ABILITY_STOPPED | EVENT_ABILITY_CRASHED
        )
    }
}

/// Run state of an ability as seen by the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbilityStatus {
    /// Not running.
    #[default]
    Stopped,
    /// Running and producing events.
    Running,
    /// The last run ended in an unrecoverable failure.
    Errored,
}

impl AbilityStatus {
    /// Map a worker status event name to the state it reports.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            EVENT_ABILITY_STARTED => Some(Self::Running),
            EVENT_ABILITY_STOPPED => Some(Self::Stopped),
            EVENT_ABILITY_CRASHED => Some(Self::Errored),
            _ => None,
        }
    }
}

/// An ability as declared by a worker at registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityDeclaration {
    /// Ability name, unique within its worker.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

/// A capability contract advertised by the system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Interface name.
    pub name: String,
    /// Arbitrary descriptive metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Interface {
    /// Create an interface with empty metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Map::new(),
        }
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.metadata.insert(key.into(), value);
        self
    }
}

/// Payload of `worker.register`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Worker display name.
    pub name: String,
    /// Abilities the worker exposes.
    #[serde(default)]
    pub abilities: Vec<AbilityDeclaration>,
    /// Interfaces the worker implements.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
}

impl Registration {
    /// Check the declaration is well-formed and return the derived key.
    pub fn validate(&self) -> Result<String, ProtocolError> {
        if self.name.trim().is_empty() {
            return Err(ProtocolError::EmptyName);
        }
        let key = key(&self.name);
        if !is_usable(&key) {
            return Err(ProtocolError::InvalidKey(self.name.clone()));
        }
        let mut seen = HashSet::new();
        for ability in &self.abilities {
            if ability.name.is_empty() {
                return Err(ProtocolError::EmptyAbilityName);
            }
            if !seen.insert(ability.name.as_str()) {
                return Err(ProtocolError::DuplicateAbility(ability.name.clone()));
            }
        }
        Ok(key)
    }
}

/// Payload of `ability.start` / `ability.stop`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityCommand {
    /// Display name (or key) of the target worker.
    pub worker_name: String,
    /// Name of the target ability on that worker.
    pub ability_name: String,
}

/// Ability entry in snapshots and `worker.registered`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityInfo {
    /// Ability name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Current run state.
    pub status: AbilityStatus,
}

/// A worker as clients see it: the `worker.registered` payload and one
/// entry of the `/api/bob` snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    /// Worker display name.
    pub name: String,
    /// Normalized registry key.
    pub key: String,
    /// Declared abilities.
    pub abilities: Vec<AbilityInfo>,
    /// Declared interfaces.
    pub interfaces: Vec<Interface>,
}

/// Payload of `worker.disconnected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDisconnected {
    /// Worker display name.
    pub name: String,
    /// Normalized registry key.
    pub key: String,
}

/// Payload of `ability.crashed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityCrashed {
    /// Terminal error of the ability loop.
    pub error: String,
}

/// Payload of `samples`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplesPayload {
    /// Samples per second.
    pub sample_rate: u32,
    /// Raw samples, oldest first.
    pub samples: Vec<i32>,
    /// Bit depth of each sample.
    pub significant_bits: u32,
    /// Audio level at or below which a chunk counts as silence.
    pub silence_max_audio_level: f64,
}
