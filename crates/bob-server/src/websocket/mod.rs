//! WebSocket connection handles, heartbeat, fan-out and the shared socket driver.

pub mod broadcast;
pub mod connection;
pub mod heartbeat;
pub mod session;
