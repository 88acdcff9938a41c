//! # bob-server
//!
//! The broker. Workers ("brains") dial one listener, front-end clients dial
//! the other; the broker tracks workers and their abilities, forwards client
//! commands to workers, and relays worker events to every client.
//!
//! - [`bob`]: [`Bob`], construction and lifecycle
//! - [`brains`]: worker-facing channel and registration handshake
//! - [`clients`]: client-facing channel, event relay, `/api` routes
//! - [`registry`]: worker, ability and interface bookkeeping
//! - [`websocket`]: connection handles, heartbeat, fan-out, socket driver

#![deny(unsafe_code)]

pub mod bob;
pub mod brains;
pub mod clients;
pub mod errors;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod websocket;

pub use bob::{Bob, Listening};
pub use errors::BobError;
pub use state::AppState;
