/*!
 * Serial port transport built on the `serialport` crate.
 *
 * Incoming data is detected by a small poll thread that watches the driver's
 * receive queue and raises the installed [`DataHandler`].
 */
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, trace, warn};

use serialflow_core::config::ConnectionConfig;
use serialflow_core::types::{Parity, StopBits};

use crate::error::TransportError;
use crate::transport::{DataHandler, Transport, TransportFactory};

/// Interval between receive-queue polls
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// List the serial ports known to the operating system
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports().map_err(map_error)?;
    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

fn map_error(err: serialport::Error) -> TransportError {
    match err.kind {
        serialport::ErrorKind::NoDevice => TransportError::PortUnavailable(err.description),
        serialport::ErrorKind::Io(kind) => {
            TransportError::from_io(std::io::Error::new(kind, err.description))
        }
        _ => TransportError::Serial(err.description),
    }
}

fn data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> Result<serialport::Parity, TransportError> {
    match parity {
        Parity::None => Ok(serialport::Parity::None),
        Parity::Odd => Ok(serialport::Parity::Odd),
        Parity::Even => Ok(serialport::Parity::Even),
        other => Err(TransportError::Serial(format!(
            "parity {:?} is not supported by this driver",
            other
        ))),
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        // The driver has no 1.5 setting; two is the closest match.
        StopBits::OnePointFive | StopBits::Two => serialport::StopBits::Two,
    }
}

/// Transport over a physical (or virtual) serial port
pub struct SerialPortTransport {
    config: ConnectionConfig,
    port: Option<Box<dyn SerialPort>>,
    handler: Arc<Mutex<Option<DataHandler>>>,
    polling: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for SerialPortTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortTransport")
            .field("port_name", &self.config.port_name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialPortTransport {
    /// Create an unopened transport
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            port: None,
            handler: Arc::new(Mutex::new(None)),
            polling: None,
        }
    }

    fn start_polling(&mut self) {
        let Some(port) = self.port.as_ref() else {
            return;
        };
        let watcher = match port.try_clone() {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(port = %self.config.port_name, "Receive notifications unavailable: {}", e);
                return;
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let handler = self.handler.clone();
        let flag = running.clone();
        let port_name = self.config.port_name.clone();

        let spawned = thread::Builder::new()
            .name(format!("serial-poll-{}", port_name))
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    match watcher.bytes_to_read() {
                        Ok(0) => {}
                        Ok(pending) => {
                            trace!(port = %port_name, pending, "Data available");
                            let current = handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
                            if let Some(notify) = current {
                                notify();
                            }
                        }
                        Err(e) => {
                            debug!(port = %port_name, "Receive poll stopped: {}", e);
                            break;
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            });

        match spawned {
            Ok(_) => self.polling = Some(running),
            Err(e) => warn!(port = %self.config.port_name, "Failed to start poll thread: {}", e),
        }
    }

    fn stop_polling(&mut self) {
        if let Some(running) = self.polling.take() {
            running.store(false, Ordering::Release);
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for SerialPortTransport {
    fn port_name(&self) -> &str {
        &self.config.port_name
    }

    fn configure(&mut self, config: &ConnectionConfig) {
        self.config = config.clone();
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(self.config.port_name.as_str(), self.config.baud_rate)
            .data_bits(data_bits(self.config.data_bits))
            .parity(parity(self.config.parity)?)
            .stop_bits(stop_bits(self.config.stop_bits))
            .timeout(self.config.read_timeout())
            .open()
            .map_err(map_error)?;

        debug!(
            port = %self.config.port_name,
            baud_rate = self.config.baud_rate,
            "Serial port opened"
        );
        self.port = Some(port);
        self.start_polling();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.stop_polling();
        if self.port.take().is_some() {
            debug!(port = %self.config.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let mut payload = self.config.encoding.encode(text);
        payload.push(b'\n');
        let write_timeout = self.config.write_timeout();

        let port = self.port_mut()?;
        port.set_timeout(write_timeout).map_err(map_error)?;
        port.write_all(&payload).map_err(TransportError::from_io)?;
        port.flush().map_err(TransportError::from_io)
    }

    fn read_existing(&mut self) -> Result<String, TransportError> {
        let read_timeout = self.config.read_timeout();
        let encoding = self.config.encoding;

        let port = self.port_mut()?;
        port.set_timeout(read_timeout).map_err(map_error)?;
        let pending = port.bytes_to_read().map_err(map_error)? as usize;
        if pending == 0 {
            return Ok(String::new());
        }

        let mut buffer = vec![0u8; pending];
        let read = match port.read(&mut buffer) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(TransportError::from_io(e)),
        };
        Ok(encoding.decode(&buffer[..read]))
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn set_data_handler(&mut self, handler: Option<DataHandler>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = handler;
    }
}

impl Drop for SerialPortTransport {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

/// Factory producing [`SerialPortTransport`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortFactory;

impl TransportFactory for SerialPortFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        Box::new(SerialPortTransport::new(config.clone()))
    }
}
