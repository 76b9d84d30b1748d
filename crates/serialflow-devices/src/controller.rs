/*!
 * Device controller.
 *
 * A controller sits on top of one connection: it runs received text through
 * its protocol parser, keeps the device's status snapshot current and sends
 * power commands on request.
 */
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

use serialflow_core::event::SharedEventBus;
use serialflow_core::logging::component_span;
use serialflow_core::types::Timestamp;

use crate::connection::{DataReceived, SerialConnection};
use crate::error::Result;
use crate::protocol::{ParsedFrame, PowerState, ProtocolParser};

/// Snapshot of what is known about a device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceStatus {
    /// Device name
    pub device: String,
    /// Last known power state
    pub power_state: PowerState,
    /// Last command seen, sent or received
    pub last_command: Option<String>,
    /// Last raw frame received
    pub last_raw: Option<String>,
    /// When the snapshot last changed
    pub updated_at: Option<Timestamp>,
}

/// Emitted whenever a controller updates its snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatusChanged {
    /// Snapshot after the update
    pub status: DeviceStatus,
    /// Power state before the update
    pub previous_power_state: PowerState,
}

struct ControllerInner {
    parser: Box<dyn ProtocolParser>,
    status: RwLock<DeviceStatus>,
    events: SharedEventBus,
}

impl ControllerInner {
    fn update(&self, apply: impl FnOnce(&mut DeviceStatus)) {
        let (status, previous_power_state) = {
            let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
            let previous = status.power_state;
            apply(&mut status);
            status.updated_at = Some(Utc::now());
            (status.clone(), previous)
        };

        if status.power_state != previous_power_state {
            info!(device = %status.device, "Power {} -> {}", previous_power_state, status.power_state);
        }
        if let Err(e) = self.events.publish(DeviceStatusChanged {
            status,
            previous_power_state,
        }) {
            warn!("Failed to publish status change: {}", e);
        }
    }

    fn apply_frame(&self, frame: ParsedFrame) {
        trace!(raw = %frame.raw, "Frame parsed");
        self.update(|status| {
            if let Some(power_state) = frame.power_state {
                status.power_state = power_state;
            }
            if frame.command.is_some() {
                status.last_command = frame.command;
            }
            status.last_raw = Some(frame.raw);
        });
    }

    fn on_data(&self, text: &str) {
        let parsed = catch_unwind(AssertUnwindSafe(|| self.parser.parse(text)));
        match parsed {
            Ok(frames) => frames.into_iter().for_each(|frame| self.apply_frame(frame)),
            Err(_) => {
                warn!(parser = self.parser.name(), "Parser panicked, resetting");
                self.parser.reset();
            }
        }
    }
}

/// Protocol-aware front end of one device
pub struct DeviceController {
    connection: Arc<SerialConnection>,
    inner: Arc<ControllerInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("connection", &self.connection.name())
            .field("parser", &self.inner.parser.name())
            .field("status", &self.status())
            .finish()
    }
}

impl DeviceController {
    /// Create a controller for a connection
    pub fn new(connection: Arc<SerialConnection>, parser: Box<dyn ProtocolParser>) -> Self {
        let status = DeviceStatus {
            device: connection.name().to_string(),
            ..DeviceStatus::default()
        };
        Self {
            connection,
            inner: Arc::new(ControllerInner {
                parser,
                status: RwLock::new(status),
                events: SharedEventBus::new(),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Start following the connection's received data
    ///
    /// Calling it again is a no-op while the listener runs.
    pub fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let mut received = self.connection.events().subscribe::<DataReceived>()?;
        let inner = Arc::downgrade(&self.inner);
        let span = component_span("controller", Some(self.connection.name()));

        *listener = Some(tokio::spawn(
            async move {
                loop {
                    match received.recv().await {
                        Ok(data) => match inner.upgrade() {
                            Some(inner) => inner.on_data(&data.text),
                            None => break,
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Controller fell behind, data dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("Controller listener stopped");
            }
            .instrument(span),
        ));
        Ok(())
    }

    /// The connection this controller drives
    pub fn connection(&self) -> &Arc<SerialConnection> {
        &self.connection
    }

    /// Current status snapshot
    pub fn status(&self) -> DeviceStatus {
        self.inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bus carrying [`DeviceStatusChanged`]
    pub fn events(&self) -> SharedEventBus {
        self.inner.events.clone()
    }

    /// Send a power command and record the commanded state on success
    pub async fn send_power_command(
        &self,
        command: &str,
        power_state: PowerState,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.connection.send_command(command, cancel).await {
            return false;
        }

        self.inner.update(|status| {
            status.power_state = power_state;
            status.last_command = Some(command.to_string());
        });
        true
    }

    /// Send `command` as the power-on command
    pub async fn turn_on(&self, command: &str, cancel: &CancellationToken) -> bool {
        self.send_power_command(command, PowerState::On, cancel).await
    }

    /// Send `command` as the power-off command
    pub async fn turn_off(&self, command: &str, cancel: &CancellationToken) -> bool {
        self.send_power_command(command, PowerState::Off, cancel).await
    }

    /// Stop the listener
    pub fn dispose(&self) {
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        self.dispose();
    }
}
