//! Worker-side error types.

use bob_core::ProtocolError;
use thiserror::Error;

/// Boxed error from a producer or resource.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of one ability.
#[derive(Debug, Error)]
pub enum AbilityError {
    /// The producer resource could not be started.
    #[error("starting {ability} failed: {source}")]
    Acquire {
        /// Ability whose start was aborted.
        ability: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },
    /// Reading from the producer failed. Terminal for the loop.
    #[error("reading sample failed: {0}")]
    Read(#[source] BoxError),
    /// Stopping the producer resource failed.
    #[error("stopping producer failed: {0}")]
    Release(#[source] BoxError),
    /// `start` was called on an ability that is not stopped.
    #[error("ability {0:?} is already running")]
    AlreadyRunning(String),
    /// An event could not be encoded for dispatch.
    #[error("dispatching event failed: {0}")]
    Dispatch(#[from] ProtocolError),
    /// The loop task panicked.
    #[error("ability loop panicked: {0}")]
    Panicked(String),
}

/// Failures of the broker connection.
#[derive(Debug, Error)]
pub enum BrainError {
    /// The broker could not be reached.
    #[error("connecting to {url} failed: {source}")]
    Connect {
        /// Broker URL.
        url: String,
        /// Underlying failure.
        #[source]
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },
    /// The broker refused or never acknowledged the registration.
    #[error("registration handshake failed: {0}")]
    Handshake(String),
    /// The socket failed after registration.
    #[error("broker connection failed: {0}")]
    Transport(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for BrainError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}
