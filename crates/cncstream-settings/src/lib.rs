//! cncstream settings
//!
//! Persisted configuration for the command-line tool: connection defaults
//! and streaming tunables, stored as JSON or TOML in the platform config
//! directory.

pub mod config;
pub mod error;

pub use config::{Config, ConfigFormat, ConnectionSettings, StreamingSettings};
pub use error::{SettingsError, SettingsResult};
