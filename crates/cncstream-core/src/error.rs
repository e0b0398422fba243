//! Error handling for cncstream
//!
//! Provides the error types for every layer of the streaming engine:
//! - Connection errors (transport faults, fatal to the session)
//! - Controller errors (state machine violations, rejected commands, alarms)
//! - Firmware errors (unparseable or unexpected protocol lines)
//! - Stream errors (corrupt or overflowing stream store files)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents errors raised by the controller state machine and by
/// commands the firmware refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// Controller operation timed out
    #[error("Controller operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Operation is not permitted in the current state
    #[error("Cannot {operation} while controller is {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: String,
        /// The state the controller was in.
        state: String,
    },

    /// A stream is already running
    #[error("A stream is already active")]
    AlreadyStreaming,

    /// Streaming was requested with an empty job
    #[error("No commands queued to stream")]
    NothingToStream,

    /// Command was rejected by the firmware
    #[error("Command rejected: {reason}")]
    CommandRejected {
        /// The reason the command was rejected.
        reason: String,
    },

    /// Alarm condition reported by the firmware
    #[error("Controller in alarm: {message}")]
    Alarm {
        /// The alarm code, when the firmware sent one.
        code: Option<u32>,
        /// The alarm message.
        message: String,
    },

    /// The operation was canceled before it completed
    #[error("Operation canceled")]
    Canceled,
}

/// Connection error type
///
/// Transport failures. Any of these ends the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// No connection is open
    #[error("Not connected")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Firmware error type
///
/// Protocol level problems. These are logged and surfaced but never
/// turned into an ok/error classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FirmwareError {
    /// Unknown firmware type
    #[error("Unknown firmware type: {name}")]
    UnknownFirmware {
        /// The unknown firmware identifier.
        name: String,
    },

    /// Response parsing error
    #[error("Failed to parse firmware response: {reason}")]
    ResponseParseError {
        /// The reason the response parsing failed.
        reason: String,
    },
}

/// Stream store error type
///
/// Format errors are unrecoverable for the file in question.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    /// A record did not split into the expected number of fields
    #[error("Corrupt stream record {row}: expected 4 fields, found {found}")]
    FieldCount {
        /// Zero based record index.
        row: u64,
        /// Number of fields found.
        found: usize,
    },

    /// A record had an unparseable field
    #[error("Corrupt stream record {row}: {reason}")]
    InvalidRecord {
        /// Zero based record index.
        row: u64,
        /// What was wrong with the record.
        reason: String,
    },

    /// The row count does not fit in the reserved header
    #[error("Row count {rows} does not fit in a {width} byte header")]
    HeaderOverflow {
        /// Rows written.
        rows: u64,
        /// Reserved header width.
        width: usize,
    },

    /// The header could not be parsed
    #[error("Invalid stream header: {reason}")]
    InvalidHeader {
        /// The reason the header is invalid.
        reason: String,
    },

    /// A field contained a line terminator
    #[error("Field '{field}' contains an embedded newline")]
    EmbeddedNewline {
        /// The offending field name.
        field: &'static str,
    },

    /// A field contained the record delimiter character
    #[error("Field '{field}' contains the record delimiter character")]
    EmbeddedDelimiter {
        /// The offending field name.
        field: &'static str,
    },

    /// The file ended before the header's row count was reached
    #[error("Stream ended after {read} of {expected} records")]
    Truncated {
        /// Rows promised by the header.
        expected: u64,
        /// Rows actually read.
        read: u64,
    },

    /// Invalid header width
    #[error("Header width must be between 1 and {max}, got {width}")]
    InvalidHeaderWidth {
        /// Requested width.
        width: usize,
        /// Largest allowed width.
        max: usize,
    },
}

/// Main error type for cncstream
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Stream store error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Controller(ControllerError::Timeout { .. }))
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a stream store format error
    pub fn is_format_error(&self) -> bool {
        matches!(self, Error::Stream(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::FieldCount { row: 7, found: 3 };
        assert_eq!(
            err.to_string(),
            "Corrupt stream record 7: expected 4 fields, found 3"
        );

        let err = ControllerError::InvalidState {
            operation: "start streaming".to_string(),
            state: "Alarm".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot start streaming while controller is Alarm");
    }

    #[test]
    fn test_error_classification() {
        let err: Error = ControllerError::Timeout { timeout_ms: 2000 }.into();
        assert!(err.is_timeout());
        assert!(err.is_controller_error());

        let err: Error = ConnectionError::ConnectionLost {
            reason: "unplugged".to_string(),
        }
        .into();
        assert!(err.is_connection_error());
        assert!(!err.is_timeout());

        let err: Error = StreamError::HeaderOverflow { rows: 100, width: 2 }.into();
        assert!(err.is_format_error());

        let err: Error = FirmwareError::ResponseParseError {
            reason: "unreadable status report '<Idle|MPos:x>'".to_string(),
        }
        .into();
        assert!(!err.is_format_error());
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_alarm_display() {
        let err = ControllerError::Alarm {
            code: Some(1),
            message: "Hard limit triggered".to_string(),
        };
        assert_eq!(err.to_string(), "Controller in alarm: Hard limit triggered");
    }
}
