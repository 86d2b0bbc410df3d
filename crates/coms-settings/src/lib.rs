//! # coms-settings
//!
//! Configuration with layered sources:
//! compiled defaults, then `~/.coms/settings.json`, then `COMS_*`
//! environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::{ComsSettings, ConnectionSettings, LoggingSettings, ServerSettings};
