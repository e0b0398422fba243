//! Serial port connection
//!
//! Wraps the `serialport` crate. The port handle is cloned so the reader
//! thread and the writers never contend for the same lock.

use super::{Connection, ConnectionParams, SerialParity};
use cncstream_core::{ConnectionError, Error, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    fn from_port(port: &serialport::SerialPortInfo) -> Self {
        let mut info = Self {
            port_name: port.port_name.clone(),
            description: port_description(port),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
            info.vid = Some(usb.vid);
            info.pid = Some(usb.pid);
            info.manufacturer = usb.manufacturer.clone();
            info.serial_number = usb.serial_number.clone();
        }
        info
    }
}

impl std::fmt::Display for SerialPortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.port_name, self.description)
    }
}

/// List serial ports that look like CNC controllers
///
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_cnc_port(&port.port_name))
        .map(SerialPortInfo::from_port)
        .collect())
}

fn is_cnc_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial-")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

/// A connection over a local serial port
pub struct SerialConnection {
    name: String,
    reader: Mutex<Box<dyn serialport::SerialPort>>,
    writer: Mutex<Box<dyn serialport::SerialPort>>,
    closed: AtomicBool,
}

impl SerialConnection {
    /// Open a serial port with the given parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        let invalid = |reason: String| ConnectionError::InvalidParameters { reason };

        let data_bits = match params.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(invalid(format!("invalid data bits: {}", other)).into()),
        };
        let stop_bits = match params.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => return Err(invalid(format!("invalid stop bits: {}", other)).into()),
        };

        let port = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(params.read_timeout_ms.max(1)))
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            })
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                }
            })?;

        let writer = port.try_clone().map_err(|e| ConnectionError::FailedToOpen {
            port: params.port.clone(),
            reason: format!("cannot clone port handle: {}", e),
        })?;

        tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
        Ok(Self {
            name: params.port.clone(),
            reader: Mutex::new(port),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(())
    }
}

fn io_failure(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => {
            ConnectionError::ConnectionLost {
                reason: e.to_string(),
            }
            .into()
        }
        _ => ConnectionError::Io {
            reason: e.to_string(),
        }
        .into(),
    }
}

impl Connection for SerialConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let mut port = self.writer.lock();
        port.write_all(data).map_err(io_failure)?;
        port.flush().map_err(io_failure)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        match self.reader.lock().read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(io_failure(e)),
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Closed {}", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cnc_port_patterns() {
        assert!(is_cnc_port("COM3"));
        assert!(is_cnc_port("/dev/ttyUSB0"));
        assert!(is_cnc_port("/dev/ttyACM1"));
        assert!(is_cnc_port("/dev/cu.usbmodem14101"));
        assert!(!is_cnc_port("COM"));
        assert!(!is_cnc_port("COMx"));
        assert!(!is_cnc_port("/dev/ttyS0"));
    }

    #[test]
    fn test_invalid_data_bits_rejected() {
        let params = ConnectionParams {
            data_bits: 9,
            ..ConnectionParams::serial("/dev/null-port", 115200)
        };
        let err = SerialConnection::open(&params).err();
        assert!(matches!(
            err,
            Some(Error::Connection(ConnectionError::InvalidParameters { .. }))
        ));
    }
}
