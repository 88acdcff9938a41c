//! Metric names recorded through the `metrics` facade.
//!
//! No recorder is installed by this crate; the embedding process decides
//! whether and where to export.

/// WebSocket connections opened total (counter, labels: channel).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter, labels: channel).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge, labels: channel).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram, labels: channel).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Broadcast sends dropped because a client queue was full or closed (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Successful worker registrations (counter).
pub const WORKER_REGISTRATIONS_TOTAL: &str = "worker_registrations_total";
/// Rejected worker registrations (counter, labels: reason).
pub const WORKER_REGISTRATIONS_REJECTED_TOTAL: &str = "worker_registrations_rejected_total";
/// Registered workers (gauge).
pub const WORKERS_ACTIVE: &str = "workers_active";
/// Worker events re-dispatched onto the bus (counter).
pub const WORKER_EVENTS_TOTAL: &str = "worker_events_total";
/// Worker events dropped for an unknown ability (counter).
pub const WORKER_EVENTS_DROPPED_TOTAL: &str = "worker_events_dropped_total";
/// Client commands forwarded to a worker (counter).
pub const COMMANDS_FORWARDED_TOTAL: &str = "commands_forwarded_total";
/// Client commands dropped for an unknown worker or ability (counter, labels: reason).
pub const COMMANDS_UNROUTED_TOTAL: &str = "commands_unrouted_total";
