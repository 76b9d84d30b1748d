/*!
 * Error types for the SerialFlow devices crate.
 */
use thiserror::Error;

use serialflow_core::error::Error as CoreError;

/// Failures raised by a transport primitive
#[derive(Error, Debug)]
pub enum TransportError {
    /// Write or read attempted before the port was opened
    #[error("Port is not open")]
    NotOpen,

    /// The operation did not complete within the configured timeout
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The port exists but cannot be used (busy, removed, access denied)
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the serial driver
    #[error("Serial error: {0}")]
    Serial(String),
}

impl TransportError {
    /// Classify an I/O error by its kind
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::Timeout(err.to_string())
            }
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => TransportError::PortUnavailable(err.to_string()),
            _ => TransportError::Io(err),
        }
    }

    /// Whether this failure means the port itself is unusable
    pub fn is_port_unavailable(&self) -> bool {
        matches!(self, TransportError::NotOpen | TransportError::PortUnavailable(_))
    }

    /// Whether this failure is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Connection parameters are unusable
    #[error("Invalid connection configuration: {0}")]
    InvalidConfig(String),

    /// The device is not connected
    #[error("Device not connected")]
    NotConnected,

    /// The connection or coordinator has been disposed
    #[error("Already disposed")]
    Disposed,

    /// A coordinator operation was called before `initialize`
    #[error("Coordinator used before initialization")]
    NotInitialized,

    /// The device identity is not managed by the coordinator
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
