//! # bob-core
//!
//! Primitives shared by the broker and the worker runtime.
//!
//! - [`protocol`]: the event envelope and payloads exchanged over both sockets
//! - [`dispatcher`]: in-process publish/subscribe bus keyed by event name
//! - [`key`]: worker key normalization
//! - [`errors`]: protocol and listener error types

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod errors;
pub mod key;
pub mod protocol;

pub use dispatcher::Dispatcher;
pub use errors::{ListenerError, ProtocolError};
pub use key::key;
pub use protocol::Event;
