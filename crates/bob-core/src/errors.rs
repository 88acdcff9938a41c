//! Protocol and listener error types.

use thiserror::Error;

/// Errors raised while decoding or validating protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON for the expected shape.
    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A worker registered without a name.
    #[error("worker name is empty")]
    EmptyName,
    /// A worker name that normalizes to a key with no word characters.
    #[error("worker name {0:?} does not produce a usable key")]
    InvalidKey(String),
    /// An ability was declared without a name.
    #[error("ability name is empty")]
    EmptyAbilityName,
    /// The same ability name was declared twice by one worker.
    #[error("duplicate ability {0:?}")]
    DuplicateAbility(String),
    /// A different event arrived where a specific one was required.
    #[error("expected {expected} event, got {got:?}")]
    UnexpectedEvent {
        /// Event name that was required.
        expected: &'static str,
        /// Event name that arrived.
        got: String,
    },
    /// The event requires a payload but carried none.
    #[error("event {0:?} has no payload")]
    MissingPayload(String),
}

/// Failure reported by a dispatcher listener.
///
/// The dispatcher logs it and carries on with the remaining listeners.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    /// Build a listener error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<ProtocolError> for ListenerError {
    fn from(err: ProtocolError) -> Self {
        Self(err.to_string())
    }
}
