/*!
 * Serial connection lifecycle.
 *
 * A [`SerialConnection`] owns at most one transport at a time. Connect and
 * disconnect are serialized by a lifecycle lock; sends are not. Every
 * transport primitive runs on the blocking pool, and every failure ends up
 * as a `false` return plus an `Error` state carrying the reason.
 */
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use serialflow_core::config::{ConnectionConfig, RetryPolicyConfig};
use serialflow_core::error::Error as CoreError;
use serialflow_core::event::SharedEventBus;
use serialflow_core::logging::operation_span;
use serialflow_core::types::Timestamp;
use serialflow_core::utils::with_cancellation;

use crate::error::{DeviceError, TransportError};
use crate::retry::{RetryError, RetryPolicies};
use crate::transport::{self, DataHandler, SharedTransport, TransportFactory};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport
    #[default]
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open and usable
    Connected,
    /// Closing the transport
    Disconnecting,
    /// The last operation failed; see the status message
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Current state plus the message attached to the last transition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Reason attached to the last transition, if any
    pub message: Option<String>,
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChanged {
    /// State before the transition
    pub old_state: ConnectionState,
    /// State after the transition
    pub new_state: ConnectionState,
    /// Reason, set for failures
    pub message: Option<String>,
}

/// Emitted for every chunk of text read from the transport
#[derive(Debug, Clone, PartialEq)]
pub struct DataReceived {
    /// Text as read, possibly holding partial or several lines
    pub text: String,
    /// When it was read
    pub timestamp: Timestamp,
}

/// Emitted after a command was written successfully
#[derive(Debug, Clone, PartialEq)]
pub struct DataSent {
    /// The command text, without the line terminator
    pub command: String,
    /// When the write completed
    pub timestamp: Timestamp,
}

/// Text waiting for `receive_stream` readers
///
/// Nothing is queued until the first reader attaches, so a connection
/// nobody streams from does not accumulate received text.
struct ReceiveQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    attached: AtomicBool,
}

impl ReceiveQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            attached: AtomicBool::new(false),
        }
    }
}

/// State reachable from the transport's data handler
struct ConnectionShared {
    name: String,
    status: RwLock<ConnectionStatus>,
    transport: Mutex<Option<SharedTransport>>,
    config: RwLock<Option<ConnectionConfig>>,
    receive: Mutex<Option<ReceiveQueue>>,
    events: SharedEventBus,
    disposed: AtomicBool,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionShared {
    fn status(&self) -> ConnectionStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, new_state: ConnectionState, message: Option<String>) {
        let old_state = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            let old_state = status.state;
            if old_state == new_state && message.is_none() && status.message.is_none() {
                return;
            }
            status.state = new_state;
            status.message = message.clone();
            old_state
        };

        match (&message, new_state) {
            (Some(reason), ConnectionState::Error) => {
                warn!(connection = %self.name, "{} -> {}: {}", old_state, new_state, reason)
            }
            _ => debug!(connection = %self.name, "{} -> {}", old_state, new_state),
        }

        self.emit(ConnectionStateChanged {
            old_state,
            new_state,
            message,
        });
    }

    fn fail(&self, reason: String) -> bool {
        self.set_state(ConnectionState::Error, Some(reason));
        false
    }

    fn emit<T: Clone + fmt::Debug + Send + Sync + 'static>(&self, event: T) {
        if let Err(e) = self.events.publish(event) {
            warn!(connection = %self.name, "Failed to publish event: {}", e);
        }
    }

    fn transport(&self) -> Option<SharedTransport> {
        locked(&self.transport).clone()
    }

    fn take_transport(&self) -> Option<SharedTransport> {
        locked(&self.transport).take()
    }

    fn close_receive(&self) {
        // Dropping the sender ends every open receive stream once drained.
        locked(&self.receive).take();
    }

    fn on_data_available(&self, transport: &SharedTransport) {
        let text = match transport::lock(transport).and_then(|mut port| port.read_existing()) {
            Ok(text) => text,
            Err(e) => {
                warn!(connection = %self.name, "Failed to read incoming data: {}", e);
                return;
            }
        };
        if text.is_empty() {
            return;
        }

        trace!(connection = %self.name, bytes = text.len(), "Data received");
        self.emit(DataReceived {
            text: text.clone(),
            timestamp: Utc::now(),
        });

        match locked(&self.receive).as_ref() {
            Some(queue) if !queue.attached.load(Ordering::SeqCst) => {
                trace!(connection = %self.name, "No reader attached, not queueing");
            }
            Some(queue) => {
                if queue.tx.send(text).is_err() {
                    warn!(connection = %self.name, "Receive queue closed, dropping data");
                }
            }
            None => debug!(connection = %self.name, "No receive queue, dropping data"),
        }
    }
}

fn data_handler(shared: &Arc<ConnectionShared>, transport: &SharedTransport) -> DataHandler {
    let shared = Arc::downgrade(shared);
    let transport = Arc::downgrade(transport);
    Arc::new(move || {
        if let (Some(shared), Some(transport)) = (shared.upgrade(), transport.upgrade()) {
            shared.on_data_available(&transport);
        }
    })
}

fn shutdown_detached(name: &str, transport: SharedTransport) {
    let name = name.to_string();
    let work = move || {
        if let Err(e) = transport::shutdown(&transport) {
            warn!(connection = %name, "Failed to close transport: {}", e);
        }
    };
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(work);
        }
        Err(_) => work(),
    }
}

/// Resolves a transition that was abandoned mid-flight (future dropped)
struct TransitionGuard {
    shared: Arc<ConnectionShared>,
    transport: Option<SharedTransport>,
    fallback: ConnectionState,
    reason: &'static str,
    armed: bool,
}

impl TransitionGuard {
    fn new(shared: &Arc<ConnectionShared>, fallback: ConnectionState, reason: &'static str) -> Self {
        Self {
            shared: shared.clone(),
            transport: None,
            fallback,
            reason,
            armed: true,
        }
    }

    fn disarm(&mut self) -> Option<SharedTransport> {
        self.armed = false;
        self.transport.take()
    }
}

impl Drop for TransitionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(transport) = self.transport.take() {
            shutdown_detached(&self.shared.name, transport);
        }
        let message = (self.fallback == ConnectionState::Error).then(|| self.reason.to_string());
        self.shared.set_state(self.fallback, message);
    }
}

fn config_reason(err: CoreError) -> String {
    match err {
        CoreError::Config(reason) => reason,
        other => other.to_string(),
    }
}

/// One serial link with retrying connect and send
pub struct SerialConnection {
    factory: Arc<dyn TransportFactory>,
    policies: Arc<RetryPolicies>,
    shared: Arc<ConnectionShared>,
    lifecycle: tokio::sync::Mutex<()>,
    policy_watch: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialConnection")
            .field("name", &self.shared.name)
            .field("status", &self.shared.status())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl SerialConnection {
    /// Create a disconnected connection
    pub fn new<S: Into<String>>(
        name: S,
        factory: Arc<dyn TransportFactory>,
        policies: Arc<RetryPolicies>,
    ) -> Self {
        Self {
            factory,
            policies,
            shared: Arc::new(ConnectionShared {
                name: name.into(),
                status: RwLock::new(ConnectionStatus::default()),
                transport: Mutex::new(None),
                config: RwLock::new(None),
                receive: Mutex::new(None),
                events: SharedEventBus::new(),
                disposed: AtomicBool::new(false),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            policy_watch: Mutex::new(None),
        }
    }

    /// Create a connection with its own policies built from `retry`
    pub fn with_retry_config<S: Into<String>>(
        name: S,
        factory: Arc<dyn TransportFactory>,
        retry: RetryPolicyConfig,
    ) -> Self {
        Self::new(name, factory, Arc::new(RetryPolicies::new(retry)))
    }

    /// Connection name used in logs
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    /// Current state and message
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Settings of the open transport
    pub fn current_config(&self) -> Option<ConnectionConfig> {
        self.shared
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether an opened transport is installed
    ///
    /// Stays `true` after a failed send, which leaves the state at `Error`
    /// but keeps the port open until disconnect.
    pub fn is_connected(&self) -> bool {
        self.shared.transport().is_some()
    }

    /// Whether [`dispose`](Self::dispose) has been called
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Bus carrying [`ConnectionStateChanged`], [`DataReceived`] and [`DataSent`]
    pub fn events(&self) -> SharedEventBus {
        self.shared.events.clone()
    }

    /// Retry policies applied to connect and send
    pub fn policies(&self) -> &Arc<RetryPolicies> {
        &self.policies
    }

    /// Follow a retry configuration channel until disposed
    pub fn watch_retry_config(&self, updates: watch::Receiver<RetryPolicyConfig>) {
        if self.is_disposed() {
            return;
        }
        if Handle::try_current().is_err() {
            warn!(connection = %self.name(), "No runtime, retry configuration will not be followed");
            return;
        }

        let handle = self.policies.watch(updates);
        if let Some(previous) = locked(&self.policy_watch).replace(handle) {
            previous.abort();
        }
    }

    /// Open a transport for `config`, retrying per the connect policy
    ///
    /// Any transport already open is closed first. Returns `false` with the
    /// state set to `Error` on invalid settings, exhausted retries or
    /// cancellation during backoff. Cancellation while waiting for the
    /// lifecycle lock returns `false` and leaves the state untouched.
    pub async fn connect(&self, config: ConnectionConfig, cancel: &CancellationToken) -> bool {
        let span = operation_span("connect", self.name());
        self.connect_inner(config, cancel).instrument(span).await
    }

    async fn connect_inner(&self, config: ConnectionConfig, cancel: &CancellationToken) -> bool {
        if self.is_disposed() {
            return self.shared.fail(DeviceError::Disposed.to_string());
        }
        if let Err(e) = config.validate() {
            return self
                .shared
                .fail(DeviceError::InvalidConfig(config_reason(e)).to_string());
        }

        let Some(_lifecycle) = with_cancellation(cancel, self.lifecycle.lock()).await else {
            debug!(connection = %self.name(), "Connect cancelled while waiting for lock");
            return false;
        };
        if self.is_disposed() {
            return self.shared.fail(DeviceError::Disposed.to_string());
        }

        if self.shared.transport().is_some() {
            self.teardown().await;
        }

        self.shared.set_state(ConnectionState::Connecting, None);
        let mut guard = TransitionGuard::new(&self.shared, ConnectionState::Error, "Connect interrupted");

        let policy = self.policies.connect_policy();
        let port = transport::share({
            let mut port = self.factory.create(&config);
            port.configure(&config);
            port
        });
        guard.transport = Some(port.clone());

        info!(
            connection = %self.name(),
            port = %config.port_name,
            baud_rate = config.baud_rate,
            max_attempts = policy.max_attempts(),
            "Connecting"
        );

        let outcome = policy
            .execute(cancel, |attempt| {
                let port = port.clone();
                async move {
                    debug!(attempt, "Opening port");
                    transport::blocking(&port, transport::open_port).await
                }
            })
            .await;

        let failure = match outcome {
            Ok(true) => None,
            Ok(false) => Some(format!(
                "Failed to open {} after {} attempts",
                config.port_name,
                policy.max_attempts()
            )),
            Err(RetryError::Cancelled) => Some(format!("Connect to {} cancelled", config.port_name)),
            Err(RetryError::Operation(e)) => Some(format!("Failed to open {}: {}", config.port_name, e)),
        };

        if let Some(reason) = failure {
            guard.disarm();
            if let Err(e) = transport::blocking(&port, transport::close_port).await {
                debug!(connection = %self.name(), "Closing failed transport: {}", e);
            }
            return self.shared.fail(reason);
        }

        guard.disarm();
        if !self.install(&port, &config) {
            debug!(connection = %self.name(), "Disposed while opening, closing transport");
            shutdown_detached(self.name(), port);
            return false;
        }

        info!(connection = %self.name(), port = %config.port_name, "Connected");
        true
    }

    /// Publish an opened transport as the current one
    ///
    /// Runs under the transport slot lock so it cannot interleave with the
    /// `take_transport` in `dispose`. Returns `false` once disposed.
    fn install(&self, port: &SharedTransport, config: &ConnectionConfig) -> bool {
        let mut slot = locked(&self.shared.transport);
        if self.is_disposed() {
            return false;
        }

        *locked(&self.shared.receive) = Some(ReceiveQueue::new());
        *self.shared.config.write().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        match transport::lock(port) {
            Ok(mut open) => open.set_data_handler(Some(data_handler(&self.shared, port))),
            Err(e) => warn!(connection = %self.name(), "Failed to install data handler: {}", e),
        }
        *slot = Some(port.clone());
        self.shared.set_state(ConnectionState::Connected, None);
        true
    }

    /// Close the transport, if any
    ///
    /// Close errors are logged, never returned. A no-op after dispose.
    pub async fn disconnect(&self, cancel: &CancellationToken) {
        if self.is_disposed() {
            return;
        }

        let span = operation_span("disconnect", self.name());
        async {
            let Some(_lifecycle) = with_cancellation(cancel, self.lifecycle.lock()).await else {
                debug!(connection = %self.name(), "Disconnect cancelled while waiting for lock");
                return;
            };
            self.teardown().await;
        }
        .instrument(span)
        .await
    }

    /// Must be called with the lifecycle lock held
    async fn teardown(&self) {
        self.shared.close_receive();
        *self.shared.config.write().unwrap_or_else(PoisonError::into_inner) = None;

        let Some(port) = self.shared.take_transport() else {
            self.shared.set_state(ConnectionState::Disconnected, None);
            return;
        };

        self.shared.set_state(ConnectionState::Disconnecting, None);
        let mut guard = TransitionGuard::new(
            &self.shared,
            ConnectionState::Disconnected,
            "Disconnect interrupted",
        );

        if let Err(e) = transport::blocking(&port, transport::close_port).await {
            warn!(connection = %self.name(), "Failed to close transport: {}", e);
        }

        guard.disarm();
        self.shared.set_state(ConnectionState::Disconnected, None);
        info!(connection = %self.name(), "Disconnected");
    }

    /// Write one command line, retrying per the send policy
    ///
    /// Returns `false` with the state set to `Error` when disposed, not
    /// connected, given a blank command, or when every attempt failed.
    /// Cancellation returns `false` without touching the state.
    pub async fn send_command(&self, command: &str, cancel: &CancellationToken) -> bool {
        if self.is_disposed() {
            return self.shared.fail(DeviceError::Disposed.to_string());
        }
        if command.trim().is_empty() {
            return self.shared.fail("Command is empty".to_string());
        }
        let Some(port) = self.shared.transport() else {
            return self.shared.fail(DeviceError::NotConnected.to_string());
        };

        let policy = self.policies.send_policy();
        let outcome = policy
            .execute(cancel, |attempt| {
                let port = port.clone();
                let line = command.to_string();
                async move {
                    trace!(attempt, "Writing command");
                    transport::blocking(&port, move |open| open.write_line(&line))
                        .await
                        .map(|()| true)
                }
            })
            .await;

        match outcome {
            Ok(true) => {
                debug!(connection = %self.name(), command, "Command sent");
                self.shared.emit(DataSent {
                    command: command.to_string(),
                    timestamp: Utc::now(),
                });
                true
            }
            Ok(false) => self.shared.fail(format!("Send failed: {}", command)),
            Err(RetryError::Cancelled) => {
                debug!(connection = %self.name(), command, "Send cancelled");
                false
            }
            Err(RetryError::Operation(e)) => self.shared.fail(send_failure(&e)),
        }
    }

    /// Stream of received text
    ///
    /// Empty when no transport is open. Ends when the connection is closed
    /// or the token fires; cancelling leaves the connection open. Each call
    /// returns a new stream reading from the same queue; text is queued
    /// from the first call on.
    pub fn receive_stream(&self, cancel: &CancellationToken) -> BoxStream<'static, String> {
        if self.shared.transport().is_none() {
            return stream::empty().boxed();
        }
        let rx = match locked(&self.shared.receive).as_ref() {
            Some(queue) => {
                queue.attached.store(true, Ordering::SeqCst);
                queue.rx.clone()
            }
            None => return stream::empty().boxed(),
        };

        stream::unfold((rx, cancel.clone()), |(rx, cancel)| async move {
            let next = with_cancellation(&cancel, async {
                let mut rx = rx.lock().await;
                rx.recv().await
            })
            .await
            .flatten()?;
            Some((next, (rx, cancel)))
        })
        .boxed()
    }

    /// Release the transport and stop following configuration changes
    ///
    /// Idempotent. Never waits: if a connect or disconnect holds the
    /// lifecycle lock, teardown proceeds without it.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = locked(&self.policy_watch).take() {
            handle.abort();
        }

        let _lifecycle = match self.lifecycle.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!(connection = %self.name(), "Lifecycle busy, disposing without lock");
                None
            }
        };

        self.shared.close_receive();
        if let Some(port) = self.shared.take_transport() {
            if let Err(e) = transport::shutdown(&port) {
                warn!(connection = %self.name(), "Failed to close transport: {}", e);
            }
        }
        *self.shared.config.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.set_state(ConnectionState::Disconnected, None);
        debug!(connection = %self.name(), "Disposed");
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn send_failure(err: &TransportError) -> String {
    if err.is_timeout() {
        format!("Send timed out: {}", err)
    } else if err.is_port_unavailable() {
        format!("Port unavailable: {}", err)
    } else {
        format!("Send failed: {}", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::mock::{MockCall, MockFailure, MockTransportFactory};

    fn connection(factory: &MockTransportFactory) -> SerialConnection {
        SerialConnection::with_retry_config(
            "test",
            Arc::new(factory.clone()),
            RetryPolicyConfig {
                connect_retry_count: 2,
                send_retry_count: 1,
                base_delay_ms: 50,
            },
        )
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_transitions() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let mut events = conn.events().subscribe::<ConnectionStateChanged>().unwrap();
        let cancel = CancellationToken::new();

        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);
        assert!(conn.is_connected());
        assert_eq!(conn.current_config().unwrap().port_name, "COM1");

        conn.disconnect(&cancel).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.current_config().is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.old_state, event.new_state));
        }
        assert_eq!(
            seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Disconnecting),
                (ConnectionState::Disconnecting, ConnectionState::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let cancel = CancellationToken::new();

        assert!(!conn.connect(ConnectionConfig::new("  "), &cancel).await);
        assert!(!conn.connect(ConnectionConfig::new("COM1").with_baud_rate(0), &cancel).await);

        let status = conn.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.message.unwrap().starts_with("Invalid connection configuration"));
        assert_eq!(factory.port("COM1").transports_created(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_connect_closes_transport() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM2");
        port.fail_all_opens(Some(MockFailure::Unavailable));
        let conn = connection(&factory);

        assert!(!conn.connect(ConnectionConfig::new("COM2"), &CancellationToken::new()).await);
        assert_eq!(port.open_count(), 3);
        assert_eq!(port.close_count(), 1);
        assert!(!port.has_handler());

        let status = conn.status();
        assert_eq!(status.state, ConnectionState::Error);
        assert!(status.message.unwrap().contains("COM2"));
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_transport() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let cancel = CancellationToken::new();

        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);
        assert!(conn.connect(ConnectionConfig::new("COM2"), &cancel).await);

        assert!(!factory.port("COM1").is_open());
        assert!(factory.port("COM2").is_open());
        assert_eq!(conn.current_config().unwrap().port_name, "COM2");
    }

    #[tokio::test]
    async fn test_send_emits_data_sent() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let mut sent = conn.events().subscribe::<DataSent>().unwrap();
        let cancel = CancellationToken::new();

        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);
        assert!(conn.send_command("POWER ON", &cancel).await);

        assert_eq!(sent.try_recv().unwrap().command, "POWER ON");
        assert_eq!(factory.port("COM1").written(), vec!["POWER ON".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_command_is_rejected() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        assert!(!conn.send_command("   ", &cancel).await);
        assert_eq!(conn.state(), ConnectionState::Error);
        assert_eq!(factory.port("COM1").write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_are_classified() {
        let cases = [
            (MockFailure::Timeout, "Send timed out"),
            (MockFailure::Unavailable, "Port unavailable"),
            (MockFailure::Io, "Send failed"),
        ];

        for (failure, prefix) in cases {
            let factory = MockTransportFactory::new();
            let port = factory.port("COM1");
            let conn = connection(&factory);
            let cancel = CancellationToken::new();
            assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

            port.fail_all_writes(Some(failure));
            assert!(!conn.send_command("ON", &cancel).await);

            let status = conn.status();
            assert_eq!(status.state, ConnectionState::Error);
            assert!(status.message.unwrap().starts_with(prefix), "{:?}", failure);
            assert_eq!(port.write_count(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_retry_recovers() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        port.fail_next_writes(1, MockFailure::Timeout);
        assert!(conn.send_command("OFF", &cancel).await);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(port.write_count(), 2);
    }

    #[tokio::test]
    async fn test_receive_stream_yields_incoming_text() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        let mut stream = conn.receive_stream(&cancel);
        assert!(port.push_incoming("PWR:1\n"));
        assert_eq!(stream.next().await.as_deref(), Some("PWR:1\n"));

        conn.disconnect(&cancel).await;
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_text_before_first_reader_is_not_queued() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let mut received = conn.events().subscribe::<DataReceived>().unwrap();
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        assert!(port.push_incoming("early\n"));
        assert_eq!(received.try_recv().unwrap().text, "early\n");

        let mut stream = conn.receive_stream(&cancel);
        assert!(port.push_incoming("late\n"));
        assert_eq!(stream.next().await.as_deref(), Some("late\n"));
    }

    #[tokio::test]
    async fn test_receive_stream_cancellation_keeps_connection() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        let reader = CancellationToken::new();
        let mut stream = conn.receive_stream(&reader);
        reader.cancel();

        assert_eq!(stream.next().await, None);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_receive_stream_empty_without_transport() {
        let conn = connection(&MockTransportFactory::new());
        let mut stream = conn.receive_stream(&CancellationToken::new());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_keeps_transport_installed() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        port.fail_next_writes(2, MockFailure::Timeout);
        assert!(!conn.send_command("ON", &cancel).await);
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.is_connected());

        assert!(conn.send_command("ON", &cancel).await);
        conn.disconnect(&cancel).await;
        assert!(!port.is_open());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_close_errors_are_swallowed() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        port.fail_close(true);
        conn.disconnect(&cancel).await;

        assert_eq!(conn.status(), ConnectionStatus::default());
        assert_eq!(port.close_count(), 1);
        assert!(!port.is_open());
        assert!(!port.has_handler());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        assert!(conn.connect(ConnectionConfig::new("COM1"), &cancel).await);

        conn.dispose();
        conn.dispose();
        assert!(!port.is_open());
        assert_eq!(port.close_count(), 1);

        let calls_before = port.calls().len();
        assert!(!conn.connect(ConnectionConfig::new("COM1"), &cancel).await);
        assert!(!conn.send_command("ON", &cancel).await);
        conn.disconnect(&cancel).await;
        assert_eq!(port.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_cancelled_lock_wait_leaves_state() {
        let factory = MockTransportFactory::new();
        let conn = connection(&factory);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!conn.connect(ConnectionConfig::new("COM1"), &cancel).await);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(factory.port("COM1").transports_created(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connect_resolves_to_error() {
        let factory = MockTransportFactory::new();
        let port = factory.port("COM1");
        port.set_delay(Duration::from_millis(50));
        let conn = connection(&factory);

        let cancel = CancellationToken::new();
        let attempt = tokio::time::timeout(
            Duration::from_millis(10),
            conn.connect(ConnectionConfig::new("COM1"), &cancel),
        )
        .await;

        assert!(attempt.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);

        // The abandoned transport is closed once the blocking open returns.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!port.is_open());
        assert_eq!(port.calls().last(), Some(&MockCall::CloseFinished));
    }
}
