//! # socketry-settings
//!
//! Configuration for the socketry server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`SocketrySettings::default()`]
//! 2. **Settings file**: `~/.socketry/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `SOCKETRY_*` overrides (highest priority)
//!
//! Unlike a global singleton, loaded settings are passed explicitly to the
//! server at construction.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{HeartbeatSettings, ServerSettings, SocketrySettings};
