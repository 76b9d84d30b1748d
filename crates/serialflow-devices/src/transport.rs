/*!
 * Transport boundary.
 *
 * A transport is a thin, blocking wrapper over one serial line. Connections
 * never call it from async code directly: every primitive runs on the
 * blocking pool, and the transport itself is owned by exactly one connection.
 */
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use serialflow_core::config::ConnectionConfig;
use serialflow_core::utils::run_blocking;

use crate::error::TransportError;

/// Callback raised by a transport when received data is waiting to be read
///
/// Transports must not invoke the handler while a caller is inside one of
/// their own methods; the handler is expected to call back into
/// [`Transport::read_existing`].
pub type DataHandler = Arc<dyn Fn() + Send + Sync>;

/// A transport shared between its owning connection and blocking I/O tasks
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Blocking primitives of a serial line
pub trait Transport: Send {
    /// Port identifier this transport talks to
    fn port_name(&self) -> &str;

    /// Apply line settings (port, baud, parity, data bits, stop bits,
    /// encoding, timeouts). Takes effect on the next `open`.
    fn configure(&mut self, config: &ConnectionConfig);

    /// Open the port
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the port; closing a closed port is a no-op
    fn close(&mut self) -> Result<(), TransportError>;

    /// Write one line of text followed by a newline
    ///
    /// Fails with [`TransportError::NotOpen`] before `open`.
    fn write_line(&mut self, text: &str) -> Result<(), TransportError>;

    /// Read all text currently buffered by the port
    ///
    /// Fails with [`TransportError::NotOpen`] before `open`.
    fn read_existing(&mut self) -> Result<String, TransportError>;

    /// Whether the port is open
    fn is_open(&self) -> bool;

    /// Install or remove the data-available notification
    fn set_data_handler(&mut self, handler: Option<DataHandler>);
}

/// Creates a fresh transport for every connect
pub trait TransportFactory: Send + Sync + Debug {
    /// Create an unopened transport for the given settings
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport>;
}

/// Wrap a transport for sharing with blocking tasks
pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

/// Lock a shared transport, treating a poisoned lock as an unusable port
pub(crate) fn lock(
    transport: &SharedTransport,
) -> Result<std::sync::MutexGuard<'_, Box<dyn Transport>>, TransportError> {
    transport
        .lock()
        .map_err(|_| TransportError::PortUnavailable("transport lock poisoned".to_string()))
}

/// Run a blocking operation against the transport on the blocking pool
pub(crate) async fn blocking<T, F>(transport: &SharedTransport, operation: F) -> Result<T, TransportError>
where
    F: FnOnce(&mut dyn Transport) -> Result<T, TransportError> + Send + 'static,
    T: Send + 'static,
{
    let transport = transport.clone();
    run_blocking(move || {
        let mut guard = lock(&transport)?;
        operation(&mut **guard)
    })
    .await
    .map_err(|e| TransportError::Serial(format!("blocking task failed: {}", e)))?
}

/// Open the port and report whether it ended up open
pub(crate) fn open_port(transport: &mut dyn Transport) -> Result<bool, TransportError> {
    transport.open()?;
    Ok(transport.is_open())
}

/// Detach the data handler and close the port
pub(crate) fn close_port(transport: &mut dyn Transport) -> Result<(), TransportError> {
    transport.set_data_handler(None);
    transport.close()
}

/// Detach the data handler and close the transport on the calling thread
pub(crate) fn shutdown(transport: &SharedTransport) -> Result<(), TransportError> {
    let mut guard = lock(transport)?;
    close_port(&mut **guard)
}
