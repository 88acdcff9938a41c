//! # bob-brain
//!
//! Worker-side runtime.
//!
//! - [`ability`]: the [`Ability`] trait and the runner driving its lifecycle
//! - [`hearing`]: continuous audio sampling dispatched in fixed-size chunks
//! - [`brain`]: [`Brain`], the broker connection relaying commands and events

#![deny(unsafe_code)]

pub mod ability;
pub mod brain;
pub mod errors;
pub mod hearing;

pub use ability::{Ability, AbilityRunner, AbilityState, EventSink};
pub use brain::{Brain, broker_url};
pub use errors::{AbilityError, BoxError, BrainError};
pub use hearing::{Hearing, HearingConfig, Lifecycle, SampleReader, SineReader};
