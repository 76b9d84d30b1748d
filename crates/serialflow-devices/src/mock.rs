/*!
 * In-memory transports for tests and demos.
 *
 * A [`MockTransportFactory`] hands out one [`MockPort`] per port name. The port
 * handle scripts open and write outcomes, injects incoming data and records
 * every primitive call in order.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serialflow_core::config::ConnectionConfig;

use crate::error::TransportError;
use crate::transport::{DataHandler, Transport, TransportFactory};

/// One recorded transport primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// Settings applied
    Configure {
        /// Baud rate at the time of the call
        baud_rate: u32,
    },
    /// `open` entered
    OpenStarted,
    /// `open` returned
    OpenFinished,
    /// `close` entered
    CloseStarted,
    /// `close` returned
    CloseFinished,
    /// `write_line` called with this text
    Write(String),
    /// `read_existing` called
    Read,
}

/// Failure injected into a scripted primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Fail with a timeout
    Timeout,
    /// Fail as if the port is busy or gone
    Unavailable,
    /// Fail with a generic I/O error
    Io,
    /// Return success but leave the port closed
    StaysClosed,
}

impl MockFailure {
    fn into_error(self, operation: &str) -> TransportError {
        match self {
            MockFailure::Timeout => TransportError::Timeout(format!("{} timed out", operation)),
            MockFailure::Unavailable => {
                TransportError::PortUnavailable(format!("{} refused by port", operation))
            }
            MockFailure::Io | MockFailure::StaysClosed => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} failed", operation),
            )),
        }
    }
}

#[derive(Default)]
struct PortState {
    calls: Vec<MockCall>,
    open: bool,
    open_script: VecDeque<MockFailure>,
    open_failure: Option<MockFailure>,
    write_script: VecDeque<MockFailure>,
    write_failure: Option<MockFailure>,
    close_failure: bool,
    incoming: String,
    written: Vec<String>,
    handler: Option<DataHandler>,
    delay: Duration,
    transports_created: usize,
}

/// Handle to the scripted state of one mock port
#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<PortState>>,
}

impl std::fmt::Debug for MockPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MockPort")
            .field("open", &state.open)
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl MockPort {
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize, failure: MockFailure) {
        self.lock().open_script.extend(std::iter::repeat(failure).take(count));
    }

    /// Make every open fail until cleared with `None`
    pub fn fail_all_opens(&self, failure: Option<MockFailure>) {
        self.lock().open_failure = failure;
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: usize, failure: MockFailure) {
        self.lock().write_script.extend(std::iter::repeat(failure).take(count));
    }

    /// Make every write fail until cleared with `None`
    pub fn fail_all_writes(&self, failure: Option<MockFailure>) {
        self.lock().write_failure = failure;
    }

    /// Make `close` report an error (the port still ends up closed)
    pub fn fail_close(&self, fail: bool) {
        self.lock().close_failure = fail;
    }

    /// Block inside `open` and `close` for this long
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Buffer incoming text and raise the data-available notification
    ///
    /// Returns whether a handler was installed to receive it.
    pub fn push_incoming(&self, text: &str) -> bool {
        let handler = {
            let mut state = self.lock();
            if !state.open {
                return false;
            }
            state.incoming.push_str(text);
            state.handler.clone()
        };

        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    /// Every recorded call, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of `open` calls
    pub fn open_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::OpenStarted))
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::CloseStarted))
    }

    /// Number of `write_line` calls, failed ones included
    pub fn write_count(&self) -> usize {
        self.count(|call| matches!(call, MockCall::Write(_)))
    }

    /// Lines that were written successfully
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    /// Whether the port is open
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Whether a data handler is installed
    pub fn has_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    /// Transports created for this port so far
    pub fn transports_created(&self) -> usize {
        self.lock().transports_created
    }

    fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }

    fn pause(&self) {
        let delay = self.lock().delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Transport backed by a [`MockPort`]
#[derive(Debug)]
pub struct MockTransport {
    port_name: String,
    port: MockPort,
}

impl MockTransport {
    /// Create a transport for a port handle
    pub fn new<S: Into<String>>(port_name: S, port: MockPort) -> Self {
        Self {
            port_name: port_name.into(),
            port,
        }
    }
}

impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn configure(&mut self, config: &ConnectionConfig) {
        self.port_name = config.port_name.clone();
        self.port.record(MockCall::Configure {
            baud_rate: config.baud_rate,
        });
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.port.record(MockCall::OpenStarted);
        self.port.pause();

        let result = {
            let mut state = self.port.lock();
            let scripted = state.open_script.pop_front().or(state.open_failure);
            match scripted {
                None => {
                    state.open = true;
                    Ok(())
                }
                Some(MockFailure::StaysClosed) => Ok(()),
                Some(failure) => Err(failure.into_error("open")),
            }
        };

        self.port.record(MockCall::OpenFinished);
        result
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.port.record(MockCall::CloseStarted);
        self.port.pause();

        let fail = {
            let mut state = self.port.lock();
            state.open = false;
            state.incoming.clear();
            state.close_failure
        };

        self.port.record(MockCall::CloseFinished);
        if fail {
            Err(MockFailure::Io.into_error("close"))
        } else {
            Ok(())
        }
    }

    fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let mut state = self.port.lock();
        state.calls.push(MockCall::Write(text.to_string()));
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if let Some(failure) = state.write_script.pop_front().or(state.write_failure) {
            return Err(failure.into_error("write"));
        }
        state.written.push(text.to_string());
        Ok(())
    }

    fn read_existing(&mut self) -> Result<String, TransportError> {
        let mut state = self.port.lock();
        state.calls.push(MockCall::Read);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        Ok(std::mem::take(&mut state.incoming))
    }

    fn is_open(&self) -> bool {
        self.port.is_open()
    }

    fn set_data_handler(&mut self, handler: Option<DataHandler>) {
        self.port.lock().handler = handler;
    }
}

/// Factory that creates [`MockTransport`]s, one shared [`MockPort`] per name
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    ports: Arc<Mutex<HashMap<String, MockPort>>>,
}

impl MockTransportFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a port, created on first use
    pub fn port(&self, name: &str) -> MockPort {
        self.ports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, config: &ConnectionConfig) -> Box<dyn Transport> {
        let port = self.port(&config.port_name);
        port.lock().transports_created += 1;
        Box::new(MockTransport::new(config.port_name.clone(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_write_before_open_is_not_open() {
        let factory = MockTransportFactory::new();
        let mut transport = factory.create(&ConnectionConfig::new("COM1"));

        assert!(matches!(transport.write_line("PING"), Err(TransportError::NotOpen)));
        assert!(matches!(transport.read_existing(), Err(TransportError::NotOpen)));
    }

    #[test]
    fn test_scripted_open_failures() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM2");
        port.fail_next_opens(1, MockFailure::Timeout);

        let mut transport = factory.create(&ConnectionConfig::new("COM2"));
        let err = tokio_test::assert_err!(transport.open());
        assert!(err.is_timeout());
        tokio_test::assert_ok!(transport.open());
        assert!(transport.is_open());
        assert_eq!(port.open_count(), 2);
    }

    #[test]
    fn test_incoming_data_raises_handler() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM3");
        let mut transport = factory.create(&ConnectionConfig::new("COM3"));
        transport.open().unwrap();

        let raised = Arc::new(AtomicUsize::new(0));
        let counter = raised.clone();
        transport.set_data_handler(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(port.push_incoming("POWER ON\n"));
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        assert_eq!(transport.read_existing().unwrap(), "POWER ON\n");
        assert_eq!(transport.read_existing().unwrap(), "");
    }
}
