//! Configuration file handling
//!
//! Configuration is organized into two sections:
//! - Connection settings (port, baud rate, firmware dialect)
//! - Streaming settings (buffer size, polling, timeouts, stream store)
//!
//! Files are JSON or TOML, chosen by extension. Missing keys fall back to
//! their defaults, so older files keep loading as settings are added.

use crate::error::{SettingsError, SettingsResult};
use cncstream_communication::{ConnectionParams, ControllerOptions, ControllerType};
use cncstream_core::stream::MAX_HEADER_WIDTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "cncstream";
const CONFIG_FILE: &str = "config.toml";

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port, or "Auto" to pick the first CNC-like port
    pub port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Firmware dialect spoken on the port
    pub firmware: ControllerType,
    /// How long to wait for the firmware to answer after opening the port
    pub timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "Auto".to_string(),
            baud_rate: 115200,
            firmware: ControllerType::Grbl,
            timeout_ms: 5000,
        }
    }
}

impl ConnectionSettings {
    pub fn is_auto_port(&self) -> bool {
        self.port.eq_ignore_ascii_case("auto")
    }

    /// Serial parameters for `port`
    pub fn params(&self, port: &str) -> ConnectionParams {
        ConnectionParams::serial(port, self.baud_rate)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Streaming settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Firmware RX buffer size; unset means the firmware's usual size
    pub buffer_size_override: Option<usize>,
    /// Status request period in milliseconds, 0 disables polling
    pub status_poll_interval_ms: u64,
    /// Timeout for settings queries and awaited commands
    pub query_timeout_ms: u64,
    /// How long a cancel waits for in-flight commands before resetting
    pub cancel_timeout_ms: u64,
    /// Width of the row count header in stream files
    pub header_width: usize,
    /// Keep at most one command in flight
    pub single_step: bool,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            buffer_size_override: None,
            status_poll_interval_ms: 200,
            query_timeout_ms: 2000,
            cancel_timeout_ms: 5000,
            header_width: 20,
            single_step: false,
        }
    }
}

impl StreamingSettings {
    /// Controller options built from these settings
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            buffer_size: self.buffer_size_override,
            status_poll_interval: Duration::from_millis(self.status_poll_interval_ms),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            cancel_timeout: Duration::from_millis(self.cancel_timeout_ms),
            single_step: self.single_step,
        }
    }
}

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from the file extension
    pub fn from_path(path: &Path) -> SettingsResult<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(Self::Json),
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Ok(Self::Toml),
            other => Err(SettingsError::UnsupportedFormat(
                other.unwrap_or("(none)").to_string(),
            )),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub streaming: StreamingSettings,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<config dir>/cncstream/config.toml`
    pub fn default_path() -> SettingsResult<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            SettingsError::ConfigDirectory("no config directory on this platform".to_string())
        })?;
        Ok(base.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load and validate a JSON or TOML file
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)?;
        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str(&content)?,
            ConfigFormat::Toml => toml::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path`, or return the defaults if it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    /// Validate and write to `path`, creating its directory if needed
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        let format = ConfigFormat::from_path(path)?;
        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        tracing::info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> SettingsResult<()> {
        if self.connection.port.trim().is_empty() {
            return Err(SettingsError::invalid("connection.port", "must not be empty"));
        }
        if self.connection.baud_rate == 0 {
            return Err(SettingsError::invalid("connection.baud_rate", "must be > 0"));
        }
        if self.connection.timeout_ms == 0 {
            return Err(SettingsError::invalid("connection.timeout_ms", "must be > 0"));
        }

        let streaming = &self.streaming;
        if streaming.buffer_size_override == Some(0) {
            return Err(SettingsError::invalid(
                "streaming.buffer_size_override",
                "must be > 0",
            ));
        }
        if streaming.query_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.query_timeout_ms",
                "must be > 0",
            ));
        }
        if streaming.cancel_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "streaming.cancel_timeout_ms",
                "must be > 0",
            ));
        }
        if streaming.header_width == 0 || streaming.header_width > MAX_HEADER_WIDTH {
            return Err(SettingsError::invalid(
                "streaming.header_width",
                format!("must be between 1 and {}", MAX_HEADER_WIDTH),
            ));
        }
        Ok(())
    }
}
