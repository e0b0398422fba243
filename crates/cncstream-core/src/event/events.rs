//! Event type definitions.
//!
//! Every notification the streaming engine makes to the outside world is a
//! variant of [`ControllerEvent`]. Events are cheap to clone; status
//! snapshots are shared through an `Arc`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::command::GcodeCommand;
use crate::data::{ControllerState, ControllerStatus};

/// Console message severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Unclassified firmware chatter
    Verbose,
    /// Informational
    Info,
    /// Something went wrong
    Error,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verbose => write!(f, "VERBOSE"),
            Self::Info => write!(f, "INFO"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Events published by the communicator and controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Transport opened
    Connected {
        /// Port or connection name.
        port: String,
        /// Firmware adapter in use.
        firmware: String,
    },
    /// Transport closed or failed
    Disconnected {
        /// Why the session ended.
        reason: String,
        /// In-flight commands discarded without completing.
        discarded: usize,
    },
    /// Command written to the firmware
    CommandSent(GcodeCommand),
    /// Command completed without being written
    CommandSkipped(GcodeCommand),
    /// Command received its terminal response
    CommandComplete(GcodeCommand),
    /// Every line received, before classification
    RawResponse(String),
    /// New status snapshot
    StatusUpdated(Arc<ControllerStatus>),
    /// Controller state machine moved
    StateChanged {
        /// Previous state.
        from: ControllerState,
        /// New state.
        to: ControllerState,
    },
    /// Sending stopped because this command failed
    PausedOnError(GcodeCommand),
    /// Every row of the stream completed
    StreamComplete {
        /// Rows written to the firmware.
        sent: u64,
        /// Rows in the job.
        total: u64,
        /// False if any row failed.
        success: bool,
    },
    /// The stream ended early
    StreamCanceled {
        /// Rows written to the firmware before the stream ended.
        sent: u64,
        /// Rows in the job.
        total: u64,
    },
    /// A stream file was attached; carries its row count
    PostProcessData(u64),
    /// Text for the operator console
    ConsoleMessage(MessageType, String),
}

impl ControllerEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Connected { .. } | Self::Disconnected { .. } => EventCategory::Connection,
            Self::CommandSent(_)
            | Self::CommandSkipped(_)
            | Self::CommandComplete(_)
            | Self::PausedOnError(_) => EventCategory::Command,
            Self::RawResponse(_) | Self::ConsoleMessage(..) => EventCategory::Console,
            Self::StatusUpdated(_) => EventCategory::Status,
            Self::StateChanged { .. } => EventCategory::State,
            Self::StreamComplete { .. } | Self::StreamCanceled { .. } | Self::PostProcessData(_) => {
                EventCategory::Stream
            }
        }
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected { port, firmware } => write!(f, "Connected to {} ({})", port, firmware),
            Self::Disconnected { reason, discarded } => {
                write!(f, "Disconnected: {} ({} discarded)", reason, discarded)
            }
            Self::CommandSent(cmd) => write!(f, "Sent {}", cmd),
            Self::CommandSkipped(cmd) => write!(f, "Skipped {}", cmd),
            Self::CommandComplete(cmd) => write!(f, "Complete {}", cmd),
            Self::RawResponse(line) => write!(f, "<< {}", line),
            Self::StatusUpdated(status) => write!(f, "Status: {}", status),
            Self::StateChanged { from, to } => write!(f, "State: {} -> {}", from, to),
            Self::PausedOnError(cmd) => write!(f, "Paused on error: {}", cmd),
            Self::StreamComplete {
                sent,
                total,
                success,
            } => write!(f, "Stream complete: {}/{} (success: {})", sent, total, success),
            Self::StreamCanceled { sent, total } => write!(f, "Stream canceled: {}/{}", sent, total),
            Self::PostProcessData(rows) => write!(f, "Stream ready: {} rows", rows),
            Self::ConsoleMessage(kind, text) => write!(f, "[{}] {}", kind, text),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Connect / disconnect
    Connection,
    /// Command lifecycle
    Command,
    /// Status snapshots
    Status,
    /// State machine transitions
    State,
    /// Stream start / end
    Stream,
    /// Raw lines and console text
    Console,
}
