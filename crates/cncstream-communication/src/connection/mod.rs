//! Byte transports to the controller
//!
//! A [`Connection`] moves raw bytes. It knows nothing about lines,
//! commands or flow control; those live in the communicator.

pub mod memory;
pub mod serial;

pub use memory::{MemoryConnection, MemoryPeer};
pub use serial::{list_ports, SerialConnection, SerialPortInfo};

use cncstream_core::Result;
use serde::{Deserialize, Serialize};

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Parameters for opening a serial connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: SerialParity,
    /// Hardware (RTS/CTS) flow control
    pub flow_control: bool,
    /// How long a single read may block before reporting no data
    pub read_timeout_ms: u64,
}

impl ConnectionParams {
    /// 8N1 parameters for the given port and baud rate
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            read_timeout_ms: 50,
        }
    }
}

/// A bidirectional byte stream to a controller.
///
/// Implementations must allow one thread to block in [`Connection::read`]
/// while another writes.
pub trait Connection: Send + Sync {
    /// Human readable name (usually the port)
    fn name(&self) -> &str;

    /// Write every byte or fail
    fn write_all(&self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` when nothing arrived within the read timeout. Any
    /// error means the transport is gone.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Close the transport. Further reads and writes fail.
    fn close(&self) -> Result<()>;
}
