//! # bob-settings
//!
//! Layered configuration for the broker and the demo worker.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BobSettings::default()`]
//! 2. **Settings file**: `~/.bob/settings.json` or an explicit path
//! 3. **Environment variables**: `BOB_*` overrides (highest priority)
//!
//! The merged value is validated before it is returned.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings_from_path, load_with, settings_path};
pub use types::*;
