//! # hubmesh-settings
//!
//! Layered configuration for a hubmesh node.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HubmeshSettings::default()`]
//! 2. **User file**: `~/.hubmesh/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `HUBMESH_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned, so a node never
//! starts with an empty topic or an idle window the broker would reject.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
