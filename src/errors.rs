use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure to bring a connection up. The manager always returns to
/// `Disconnected` after one of these; no partially-open handle survives.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("permission denied opening {device}: {reason}")]
    PermissionDenied { device: String, reason: String },
    #[error("device unavailable: {device}: {reason}")]
    DeviceUnavailable { device: String, reason: String },
    #[error("transport failure on {device}: {reason}")]
    TransportFailure { device: String, reason: String },
    #[error("already connected or connecting (state: {state})")]
    AlreadyConnected { state: String },
    #[error("connect to {device} cancelled by disconnect")]
    Cancelled { device: String },
}

impl ConnectError {
    /// Classify a driver failure raised while opening/configuring `device`.
    pub fn from_transport(device: &str, err: TransportError) -> Self {
        let device = device.to_string();
        let reason = err.to_string();
        if err.is_permission_denied() {
            ConnectError::PermissionDenied { device, reason }
        } else if err.is_unavailable() {
            ConnectError::DeviceUnavailable { device, reason }
        } else {
            ConnectError::TransportFailure { device, reason }
        }
    }
}

/// Per-frame decode failure. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("corrupt frame: expected {expected} bytes, got {actual}")]
    Corrupt { expected: usize, actual: usize },
}

/// Fatal read failure; faults the connection and terminates every subscription.
///
/// Clonable so the same error can be handed to each subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport read failed ({kind:?}): {message}")]
pub struct TransportReadError {
    pub kind: io::ErrorKind,
    pub message: String,
}

impl From<io::Error> for TransportReadError {
    fn from(err: io::Error) -> Self {
        TransportReadError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("calibration requires an active connection")]
    NotConnected,
    #[error("no calibration response within {0:?}")]
    Timeout(Duration),
    #[error("calibration command write failed: {0}")]
    TransportFailure(String),
}

/// Errors raised by a [`crate::transport::TransportDriver`] or its ports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("port already closed")]
    Closed,
}

impl TransportError {
    pub fn is_permission_denied(&self) -> bool {
        match self {
            TransportError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            TransportError::Serial(e) => {
                e.kind() == serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied)
            }
            TransportError::Closed => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ),
            TransportError::Serial(e) => matches!(
                e.kind(),
                serialport::ErrorKind::NoDevice
                    | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
            ),
            TransportError::Closed => true,
        }
    }
}

/// Returned by `subscribe` once the stream has been closed (or was never opened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sample stream is closed")]
pub struct StreamClosed;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_driver_failures() {
        let denied = TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(
            ConnectError::from_transport("/dev/ttyUSB0", denied),
            ConnectError::PermissionDenied { .. }
        ));

        let missing = TransportError::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "gone",
        ));
        assert!(matches!(
            ConnectError::from_transport("/dev/ttyUSB0", missing),
            ConnectError::DeviceUnavailable { .. }
        ));

        let other = TransportError::Io(io::Error::new(io::ErrorKind::Other, "line noise"));
        assert!(matches!(
            ConnectError::from_transport("/dev/ttyUSB0", other),
            ConnectError::TransportFailure { .. }
        ));
    }

    #[test]
    fn read_error_keeps_kind() {
        let err = TransportReadError::from(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        assert_eq!(err.kind, io::ErrorKind::BrokenPipe);
        assert!(err.to_string().contains("unplugged"));
    }
}
