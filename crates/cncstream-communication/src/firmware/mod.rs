//! Firmware adapters
//!
//! Everything that differs between controller dialects lives behind
//! [`FirmwareAdapter`]. One adapter is chosen when a connection is opened
//! and shared by the communicator, the controller and the status poller.
//!
//! Supported controllers:
//! - GRBL: plain text `ok` / `error:n` protocol with `<...>` status reports
//! - TinyG: JSON protocol with `{"r":..}` acknowledgments and `{"sr":..}` reports

pub mod grbl;
pub mod settings;
pub mod tinyg;

pub use grbl::GrblAdapter;
pub use settings::FirmwareSetting;
pub use tinyg::TinyGAdapter;

use cncstream_core::{split_comment, ControllerStatus, FirmwareError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Supported CNC controller types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerType {
    /// GRBL (default, most common)
    #[default]
    Grbl,
    /// TinyG
    TinyG,
}

impl ControllerType {
    /// Build the adapter for this controller type
    pub fn adapter(self) -> Arc<dyn FirmwareAdapter> {
        match self {
            Self::Grbl => Arc::new(GrblAdapter::new()),
            Self::TinyG => Arc::new(TinyGAdapter::new()),
        }
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grbl => write!(f, "GRBL"),
            Self::TinyG => write!(f, "TinyG"),
        }
    }
}

impl FromStr for ControllerType {
    type Err = cncstream_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grbl" => Ok(Self::Grbl),
            "tinyg" => Ok(Self::TinyG),
            _ => Err(FirmwareError::UnknownFirmware {
                name: s.to_string(),
            }
            .into()),
        }
    }
}

/// Classification of one line received from the firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Positive acknowledgment of the oldest in-flight command
    Ok,
    /// Negative acknowledgment of the oldest in-flight command
    Error(String),
    /// Asynchronous status report
    Status,
    /// Alarm report; never correlated with a command
    Alarm {
        code: Option<u32>,
        message: String,
    },
    /// Firmware setting line
    Setting,
    /// Anything else
    Message,
}

impl ResponseKind {
    /// True for lines that resolve an in-flight command
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ok | Self::Error(_))
    }
}

type LinePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A structured request/response exchange with the firmware.
///
/// The trigger is sent as a normal command. While the query is active,
/// every line accepted by `matches` is collected; a line accepted by
/// `terminal` ends the query, but only once at least one line matched.
/// Each line is tested against `matches` before `terminal`, so a single
/// line may do both.
#[derive(Clone)]
pub struct QuerySpec {
    trigger: String,
    matches: LinePredicate,
    terminal: LinePredicate,
}

impl QuerySpec {
    pub fn new<M, T>(trigger: impl Into<String>, matches: M, terminal: T) -> Self
    where
        M: Fn(&str) -> bool + Send + Sync + 'static,
        T: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            trigger: trigger.into(),
            matches: Arc::new(matches),
            terminal: Arc::new(terminal),
        }
    }

    /// Command that starts the exchange
    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn is_match(&self, line: &str) -> bool {
        (self.matches)(line)
    }

    pub fn is_terminal(&self, line: &str) -> bool {
        (self.terminal)(line)
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySpec")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

/// Dialect specific behavior of a controller firmware
pub trait FirmwareAdapter: Send + Sync + fmt::Debug {
    fn controller_type(&self) -> ControllerType;

    /// Firmware RX buffer budget in bytes
    fn buffer_size(&self) -> usize;

    /// Turn a source line into firmware-ready text.
    ///
    /// Comments and whitespace are removed. An empty result means the
    /// line never goes on the wire.
    fn build_command(&self, text: &str) -> String {
        let (code, _) = split_comment(text);
        code.chars().filter(|c| !c.is_whitespace()).collect()
    }

    /// Classify one received line
    fn classify(&self, line: &str) -> ResponseKind;

    /// Build a status snapshot from a status line, carrying over fields
    /// the report leaves out from `prior`
    fn parse_status(&self, line: &str, prior: &ControllerStatus) -> Option<ControllerStatus>;

    /// Realtime bytes that request a status report
    fn status_request(&self) -> &[u8];

    /// Realtime feed hold
    fn pause_bytes(&self) -> &[u8];

    /// Realtime cycle start
    fn resume_bytes(&self) -> &[u8];

    /// Written when a cancel is requested
    fn cancel_bytes(&self) -> &[u8];

    /// Written once every in-flight command has resolved after a cancel
    fn after_cancel_bytes(&self) -> &[u8];

    /// Soft reset
    fn reset_bytes(&self) -> &[u8];

    /// Command that clears an alarm lock
    fn unlock_command(&self) -> &str;

    /// Exchange that lists the firmware settings
    fn settings_query(&self) -> QuerySpec;

    /// Turn the lines collected by [`FirmwareAdapter::settings_query`] into settings
    fn parse_settings(&self, lines: &[String]) -> Vec<FirmwareSetting>;
}
