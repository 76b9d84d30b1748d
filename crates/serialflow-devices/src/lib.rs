/*!
 * SerialFlow Devices
 *
 * This crate provides serial connections with retrying connect and send,
 * hot-reloadable retry policies, protocol-aware device controllers, and the
 * coordinator that runs a fixed set of devices side by side.
 */

#![warn(missing_docs)]

// Re-export core types
pub use serialflow_core::prelude;

pub mod connection;
pub mod controller;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod retry;
pub mod transport;

#[cfg(feature = "serial")]
pub mod serial;

pub use connection::{
    ConnectionState, ConnectionStateChanged, ConnectionStatus, DataReceived, DataSent,
    SerialConnection,
};
pub use controller::{DeviceController, DeviceStatus, DeviceStatusChanged};
pub use coordinator::DeviceCoordinator;
pub use device::{DeviceId, DeviceKey};
pub use error::{DeviceError, TransportError};
pub use protocol::{LineProtocolParser, ParsedFrame, PowerState, ProtocolParser};
pub use retry::{ReloadOutcome, RetryPolicies, RetryPolicy};
pub use transport::{Transport, TransportFactory};

/// SerialFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), serialflow_core::error::Error> {
    tracing::info!("SerialFlow Devices {} initialized", VERSION);
    Ok(())
}

/// Names of the transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["mock"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}
