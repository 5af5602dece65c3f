//! # aqueduct-settings
//!
//! Layered configuration for the bridge.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`Settings::default()`]
//! 2. **Settings file**: `~/.aqueduct/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `DB_*` and `AQUEDUCT_*` overrides
//!
//! Database connection settings are resolved once per client connection by
//! the backend connector; nothing here is mutated after startup.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
