//! Broker bookkeeping: workers, their abilities, and declared interfaces.

pub mod abilities;
pub mod interfaces;
pub mod workers;
