//! Transport boundary: device enumeration, port lifecycle and raw byte I/O.
//!
//! The connection manager only talks to these traits. [`SerialDriver`] is the
//! real implementation over `serialport`; `crate::simulator` provides an
//! in-process one.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity, SerialPort, SerialPortType, StopBits};

use crate::errors::TransportError;

// ============================================================================
// Protocol constants
// ============================================================================

/// Serial baud rate fixed by the instrument firmware.
pub const BAUD_RATE: u32 = 115_200;

/// Line parameters the instrument requires (115200 8N1).
pub const PROTOCOL_LINE: LineSettings = LineSettings {
    baud_rate: BAUD_RATE,
    data_bits: DataBits::Eight,
    stop_bits: StopBits::One,
    parity: Parity::None,
};

/// Streaming starts once both DTR and RTS are asserted.
pub const ASSERT_DTR: bool = true;
pub const ASSERT_RTS: bool = true;

// ============================================================================
// Data Types
// ============================================================================

/// An enumerated device the driver can open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Driver-specific address, e.g. `/dev/ttyUSB0` or `COM3`.
    pub path: String,
    /// Human-readable description, when the OS provides one.
    pub description: Option<String>,
}

impl DeviceHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: None,
        }
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(desc) => write!(f, "{} ({})", self.path, desc),
            None => f.write_str(&self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

// ============================================================================
// Driver traits
// ============================================================================

/// Entry point to a family of devices.
pub trait TransportDriver: Send + Sync {
    fn list_devices(&self) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Open `device`. `read_timeout` bounds each blocking read on the port.
    fn open(
        &self,
        device: &DeviceHandle,
        read_timeout: Duration,
    ) -> Result<Box<dyn TransportPort>, TransportError>;
}

/// An open port. Owned by exactly one connection; all writes go through it.
pub trait TransportPort: Send {
    fn configure(&mut self, line: &LineSettings) -> Result<(), TransportError>;

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError>;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Independent read handle feeding the reader loop.
    fn reader(&mut self) -> Result<Box<dyn ChunkReader>, TransportError>;

    /// Release the OS handle. Further calls on this port fail.
    fn close(&mut self);
}

/// Source of byte chunks.
///
/// `Ok(0)` means end of stream. Errors of kind `TimedOut`, `WouldBlock` and
/// `Interrupted` mean "nothing yet" and are retried by the caller.
pub trait ChunkReader: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read + Send> ChunkReader for T {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// True for read errors that only mean no data arrived in time.
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ============================================================================
// Serial implementation
// ============================================================================

/// Serial ports enumerated and opened through `serialport`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialDriver;

impl TransportDriver for SerialDriver {
    fn list_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let description = match p.port_type {
                    SerialPortType::UsbPort(usb) => Some(match usb.product {
                        Some(product) => format!("USB {:04x}:{:04x} {}", usb.vid, usb.pid, product),
                        None => format!("USB {:04x}:{:04x}", usb.vid, usb.pid),
                    }),
                    SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                    _ => None,
                };
                DeviceHandle {
                    path: p.port_name,
                    description,
                }
            })
            .collect())
    }

    fn open(
        &self,
        device: &DeviceHandle,
        read_timeout: Duration,
    ) -> Result<Box<dyn TransportPort>, TransportError> {
        debug!("opening serial port: path={}", device.path);
        let port = serialport::new(&device.path, BAUD_RATE)
            .timeout(read_timeout)
            .open()?;
        Ok(Box::new(SerialTransport { port: Some(port) }))
    }
}

struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl TransportPort for SerialTransport {
    fn configure(&mut self, line: &LineSettings) -> Result<(), TransportError> {
        let port = self.port()?;
        port.set_baud_rate(line.baud_rate)?;
        port.set_data_bits(line.data_bits)?;
        port.set_stop_bits(line.stop_bits)?;
        port.set_parity(line.parity)?;
        port.set_flow_control(serialport::FlowControl::None)?;
        Ok(())
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_data_terminal_ready(dtr)?;
        port.write_request_to_send(rts)?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn ChunkReader>, TransportError> {
        let clone = self.port()?.try_clone()?;
        Ok(Box::new(clone))
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            debug!("closing serial port: name={:?}", port.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_line_is_115200_8n1() {
        assert_eq!(PROTOCOL_LINE.baud_rate, 115_200);
        assert_eq!(PROTOCOL_LINE.data_bits, DataBits::Eight);
        assert_eq!(PROTOCOL_LINE.stop_bits, StopBits::One);
        assert_eq!(PROTOCOL_LINE.parity, Parity::None);
    }

    #[test]
    fn idle_errors() {
        assert!(is_idle_error(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(is_idle_error(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_idle_error(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn device_display() {
        let mut dev = DeviceHandle::new("/dev/ttyUSB0");
        assert_eq!(dev.to_string(), "/dev/ttyUSB0");
        dev.description = Some("USB 0403:6001".into());
        assert_eq!(dev.to_string(), "/dev/ttyUSB0 (USB 0403:6001)");
    }

    #[test]
    fn reader_blanket_impl_reads_slices() {
        let mut src: &[u8] = &[1, 2, 3];
        let mut buf = [0u8; 8];
        assert_eq!(src.read_chunk(&mut buf).unwrap(), 3);
        assert_eq!(src.read_chunk(&mut buf).unwrap(), 0);
    }
}
