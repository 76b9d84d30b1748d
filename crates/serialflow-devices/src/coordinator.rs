/*!
 * Multi-device coordinator.
 *
 * The coordinator owns one [`SerialConnection`] and one [`DeviceController`]
 * per device key, created together by [`DeviceCoordinator::initialize`] and
 * released together by [`DeviceCoordinator::dispose`]. Events from every
 * device are re-published on one bus, tagged with the device key.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use serialflow_core::config::{AppConfig, ConfigRepository, DeviceConfig, RetryPolicyConfig};
use serialflow_core::event::{SharedEventBus, Tagged};
use serialflow_core::logging::component_span;

use crate::connection::{
    ConnectionState, ConnectionStateChanged, DataReceived, DataSent, SerialConnection,
};
use crate::controller::{DeviceController, DeviceStatus, DeviceStatusChanged};
use crate::device::{DeviceId, DeviceKey};
use crate::error::{DeviceError, Result};
use crate::protocol::{line_parser_factory, ParserFactory};
use crate::transport::TransportFactory;

/// Command sent by `turn_on` when none is configured
pub const DEFAULT_ON_COMMAND: &str = "ON";
/// Command sent by `turn_off` when none is configured
pub const DEFAULT_OFF_COMMAND: &str = "OFF";

struct DeviceSlot {
    connection: Arc<SerialConnection>,
    controller: DeviceController,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSlot {
    fn shutdown(&self) {
        for task in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.controller.dispose();
        self.connection.dispose();
    }
}

/// Re-publish every `E` from one device bus as `Tagged<K, E>` on another
fn forward<K, E>(source: K, from: &SharedEventBus, to: &SharedEventBus) -> Result<JoinHandle<()>>
where
    K: DeviceKey,
    E: Clone + Debug + Send + Sync + 'static,
{
    let mut events = from.subscribe::<E>()?;
    let to = to.clone();

    Ok(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = to.publish(Tagged::new(source, event)) {
                        warn!(device = %source, "Failed to forward event: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(device = %source, skipped, "Event forwarding fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }))
}

/// Owner of every device connection and controller
pub struct DeviceCoordinator<K: DeviceKey = DeviceId> {
    repository: Arc<dyn ConfigRepository>,
    factory: Arc<dyn TransportFactory>,
    parsers: ParserFactory,
    events: SharedEventBus,
    config: RwLock<AppConfig>,
    retry_updates: watch::Sender<RetryPolicyConfig>,
    slots: RwLock<HashMap<K, Arc<DeviceSlot>>>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl<K: DeviceKey> Debug for DeviceCoordinator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCoordinator")
            .field("devices", &K::all())
            .field("initialized", &self.is_initialized())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl DeviceCoordinator<DeviceId> {
    /// Create a coordinator for the bundled [`DeviceId`] domain
    pub fn new(repository: Arc<dyn ConfigRepository>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::for_keys(repository, factory)
    }
}

impl<K: DeviceKey> DeviceCoordinator<K> {
    /// Create a coordinator for the device domain `K`
    pub fn for_keys(repository: Arc<dyn ConfigRepository>, factory: Arc<dyn TransportFactory>) -> Self {
        let (retry_updates, _) = watch::channel(RetryPolicyConfig::default());
        Self {
            repository,
            factory,
            parsers: line_parser_factory(),
            events: SharedEventBus::new(),
            config: RwLock::new(AppConfig::default()),
            retry_updates,
            slots: RwLock::new(HashMap::new()),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Use a different parser for every device
    pub fn with_parser_factory(mut self, parsers: ParserFactory) -> Self {
        self.parsers = parsers;
        self
    }

    /// Whether `initialize` has completed
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Aggregate bus carrying `Tagged<K, E>` for [`ConnectionStateChanged`],
    /// [`DataReceived`], [`DataSent`] and [`DeviceStatusChanged`]
    pub fn events(&self) -> SharedEventBus {
        self.events.clone()
    }

    /// Load settings and create every device
    ///
    /// Idempotent. A failed load falls back to default settings.
    pub async fn initialize(&self) -> Result<()> {
        let _init = self.init_lock.lock().await;
        if self.is_disposed() {
            warn!("Coordinator already disposed, not initializing");
            return Ok(());
        }
        if self.is_initialized() {
            return Ok(());
        }

        self.load_devices()
            .instrument(component_span("coordinator", None))
            .await
    }

    async fn load_devices(&self) -> Result<()> {
        let mut config = match self.repository.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to load configuration, using defaults: {}", e);
                AppConfig::default()
            }
        };
        for key in K::all() {
            config.device_mut(&key.to_string());
        }
        self.retry_updates.send_replace(config.retry);

        let mut slots = HashMap::new();
        for key in K::all() {
            let slot = self.create_slot(key, config.retry)?;
            slots.insert(key, Arc::new(slot));
        }

        let count = slots.len();
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        *self.slots.write().unwrap_or_else(PoisonError::into_inner) = slots;
        self.initialized.store(true, Ordering::SeqCst);
        info!(devices = count, "Device coordinator initialized");
        Ok(())
    }

    fn create_slot(&self, key: K, retry: RetryPolicyConfig) -> Result<DeviceSlot> {
        let connection = Arc::new(SerialConnection::with_retry_config(
            key.to_string(),
            self.factory.clone(),
            retry,
        ));
        connection.watch_retry_config(self.retry_updates.subscribe());

        let controller = DeviceController::new(connection.clone(), (self.parsers)());
        controller.start()?;

        let device_events = connection.events();
        let forwarders = vec![
            forward::<K, ConnectionStateChanged>(key, &device_events, &self.events)?,
            forward::<K, DataReceived>(key, &device_events, &self.events)?,
            forward::<K, DataSent>(key, &device_events, &self.events)?,
            forward::<K, DeviceStatusChanged>(key, &controller.events(), &self.events)?,
        ];

        debug!(device = %key, "Device created");
        Ok(DeviceSlot {
            connection,
            controller,
            forwarders: Mutex::new(forwarders),
        })
    }

    /// `Ok(None)` once disposed
    fn slot(&self, id: K) -> Result<Option<Arc<DeviceSlot>>> {
        if self.is_disposed() {
            return Ok(None);
        }
        if !self.is_initialized() {
            return Err(DeviceError::NotInitialized);
        }

        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&id) {
            Some(slot) => Ok(Some(slot.clone())),
            None if self.is_disposed() => Ok(None),
            None => Err(DeviceError::UnknownDevice(id.to_string())),
        }
    }

    fn slots(&self) -> Result<Vec<(K, Arc<DeviceSlot>)>> {
        if !self.is_disposed() && !self.is_initialized() {
            return Err(DeviceError::NotInitialized);
        }
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(K::all()
            .into_iter()
            .filter_map(|key| slots.get(&key).map(|slot| (key, slot.clone())))
            .collect())
    }

    fn settings(&self, id: K) -> DeviceConfig {
        let name = id.to_string();
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .device(&name)
            .cloned()
            .unwrap_or_else(|| DeviceConfig::named(name))
    }

    fn ensure_usable(&self) -> Result<bool> {
        if self.is_disposed() {
            return Ok(false);
        }
        if !self.is_initialized() {
            return Err(DeviceError::NotInitialized);
        }
        Ok(true)
    }

    async fn persist(&self) {
        let snapshot = self.config_snapshot();
        if let Err(e) = self.repository.save(&snapshot).await {
            warn!("Failed to save configuration: {}", e);
        }
    }

    /// Connect one device using its configured port and line settings
    ///
    /// Returns `false` when no port is configured. Settings are saved after
    /// a successful connect.
    pub async fn connect(&self, id: K, cancel: &CancellationToken) -> Result<bool> {
        let Some(slot) = self.slot(id)? else {
            return Ok(false);
        };

        let device = self.settings(id);
        if !device.has_port() {
            warn!(device = %id, "No port configured");
            return Ok(false);
        }

        let connected = slot.connection.connect(device.connection_config(), cancel).await;
        if connected {
            self.persist().await;
        }
        Ok(connected)
    }

    /// Disconnect one device
    pub async fn disconnect(&self, id: K, cancel: &CancellationToken) -> Result<()> {
        if let Some(slot) = self.slot(id)? {
            slot.connection.disconnect(cancel).await;
        }
        Ok(())
    }

    /// Connect every locked device with a configured port, concurrently
    ///
    /// The result holds an entry for every device key. Devices that are
    /// already connected report `true` without reconnecting; ineligible
    /// devices report `false`.
    pub async fn connect_all(&self, cancel: &CancellationToken) -> Result<HashMap<K, bool>> {
        let slots = self.slots()?;
        let mut results: HashMap<K, bool> = K::all().into_iter().map(|key| (key, false)).collect();

        let mut attempts = Vec::new();
        for (key, slot) in slots {
            if slot.connection.is_connected() {
                results.insert(key, true);
                continue;
            }

            let device = self.settings(key);
            if !device.locked || !device.has_port() {
                debug!(device = %key, locked = device.locked, "Skipped by connect-all");
                continue;
            }

            let config = device.connection_config();
            let cancel = cancel.clone();
            attempts.push(async move {
                let outcome = AssertUnwindSafe(slot.connection.connect(config, &cancel))
                    .catch_unwind()
                    .await;
                (key, outcome)
            });
        }

        let mut any_connected = false;
        for (key, outcome) in join_all(attempts).await {
            let connected = match outcome {
                Ok(connected) => connected,
                Err(_) => {
                    error!(device = %key, "Connect panicked");
                    false
                }
            };
            any_connected |= connected;
            results.insert(key, connected);
        }

        if any_connected {
            self.persist().await;
        }
        Ok(results)
    }

    /// Disconnect every connected device, concurrently
    pub async fn disconnect_all(&self, cancel: &CancellationToken) -> Result<()> {
        let attempts = self
            .slots()?
            .into_iter()
            .filter(|(_, slot)| slot.connection.is_connected())
            .map(|(key, slot)| {
                let cancel = cancel.clone();
                async move {
                    let outcome = AssertUnwindSafe(slot.connection.disconnect(&cancel))
                        .catch_unwind()
                        .await;
                    (key, outcome)
                }
            });

        for (key, outcome) in join_all(attempts).await {
            if outcome.is_err() {
                error!(device = %key, "Disconnect panicked");
            }
        }
        Ok(())
    }

    /// Send the device's on command
    pub async fn turn_on(&self, id: K, cancel: &CancellationToken) -> Result<bool> {
        self.switch(id, true, cancel).await
    }

    /// Send the device's off command
    pub async fn turn_off(&self, id: K, cancel: &CancellationToken) -> Result<bool> {
        self.switch(id, false, cancel).await
    }

    async fn switch(&self, id: K, on: bool, cancel: &CancellationToken) -> Result<bool> {
        let Some(slot) = self.slot(id)? else {
            return Ok(false);
        };
        if !slot.connection.is_connected() {
            debug!(device = %id, "Not connected, ignoring power command");
            return Ok(false);
        }

        let device = self.settings(id);
        let (configured, fallback) = if on {
            (device.on_command, DEFAULT_ON_COMMAND)
        } else {
            (device.off_command, DEFAULT_OFF_COMMAND)
        };
        let command = configured
            .filter(|command| !command.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string());

        let sent = if on {
            slot.controller.turn_on(&command, cancel).await
        } else {
            slot.controller.turn_off(&command, cancel).await
        };
        Ok(sent)
    }

    /// Change a device's port, baud rate and lock flag
    ///
    /// An empty port marks the device unconfigured. The settings are
    /// updated regardless of the baud rate; the return value only reports
    /// whether the baud rate was positive.
    pub fn try_update_connection_config(
        &self,
        id: K,
        port: &str,
        baud_rate: i64,
        locked: bool,
    ) -> Result<bool> {
        if !self.ensure_usable()? {
            return Ok(false);
        }

        let stored_baud = u32::try_from(baud_rate.max(0)).unwrap_or(u32::MAX);
        {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let device = config.device_mut(&id.to_string());
            device.port = port.trim().to_string();
            device.connection.baud_rate = stored_baud;
            device.locked = locked;
        }

        debug!(device = %id, port, baud_rate, locked, "Connection settings updated");
        Ok(baud_rate > 0)
    }

    /// Change the commands sent by `turn_on` / `turn_off`
    pub fn set_power_commands(
        &self,
        id: K,
        on_command: Option<String>,
        off_command: Option<String>,
    ) -> Result<()> {
        if !self.ensure_usable()? {
            return Ok(());
        }

        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let device = config.device_mut(&id.to_string());
        device.on_command = on_command;
        device.off_command = off_command;
        Ok(())
    }

    /// Store new retry settings and push them to every connection
    ///
    /// Out-of-range settings are refused with `Ok(false)`.
    pub fn update_retry_policy(&self, retry: RetryPolicyConfig) -> Result<bool> {
        if !self.ensure_usable()? {
            return Ok(false);
        }
        if let Err(e) = retry.validate() {
            warn!("Refusing retry settings: {}", e);
            return Ok(false);
        }

        self.config.write().unwrap_or_else(PoisonError::into_inner).retry = retry;
        self.retry_updates.send_replace(retry);
        info!(
            connect_retries = retry.connect_retry_count,
            send_retries = retry.send_retry_count,
            base_delay_ms = retry.base_delay_ms,
            "Retry settings published"
        );
        Ok(true)
    }

    /// Persist the current settings
    pub async fn save_config(&self) -> Result<()> {
        if !self.ensure_usable()? {
            return Ok(());
        }
        let snapshot = self.config_snapshot();
        self.repository.save(&snapshot).await?;
        Ok(())
    }

    /// Copy of the current settings
    pub fn config_snapshot(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copy of one device's settings
    pub fn device_config(&self, id: K) -> DeviceConfig {
        self.settings(id)
    }

    /// The connection of one device
    pub fn connection(&self, id: K) -> Result<Option<Arc<SerialConnection>>> {
        Ok(self.slot(id)?.map(|slot| slot.connection.clone()))
    }

    /// Connection state of one device
    pub fn connection_state(&self, id: K) -> Result<ConnectionState> {
        Ok(self
            .slot(id)?
            .map(|slot| slot.connection.state())
            .unwrap_or_default())
    }

    /// Whether one device is connected
    pub fn is_connected(&self, id: K) -> Result<bool> {
        Ok(self
            .slot(id)?
            .map(|slot| slot.connection.is_connected())
            .unwrap_or(false))
    }

    /// Status snapshot of one device
    pub fn status(&self, id: K) -> Result<DeviceStatus> {
        Ok(self
            .slot(id)?
            .map(|slot| slot.controller.status())
            .unwrap_or_else(|| DeviceStatus {
                device: id.to_string(),
                ..DeviceStatus::default()
            }))
    }

    /// Text received by one device
    pub fn receive_stream(
        &self,
        id: K,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, String>> {
        Ok(match self.slot(id)? {
            Some(slot) => slot.connection.receive_stream(cancel),
            None => stream::empty().boxed(),
        })
    }

    /// Release every device
    ///
    /// Idempotent; every later operation is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let slots = std::mem::take(&mut *self.slots.write().unwrap_or_else(PoisonError::into_inner));
        for (key, slot) in slots {
            slot.shutdown();
            debug!(device = %key, "Device released");
        }
        info!("Device coordinator disposed");
    }
}

impl<K: DeviceKey> Drop for DeviceCoordinator<K> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialflow_core::config::InMemoryConfigRepository;

    use crate::mock::MockTransportFactory;

    fn coordinator() -> (DeviceCoordinator, Arc<InMemoryConfigRepository>) {
        let repository = Arc::new(InMemoryConfigRepository::default());
        let coordinator = DeviceCoordinator::new(repository.clone(), Arc::new(MockTransportFactory::new()));
        (coordinator, repository)
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let (coordinator, _) = coordinator();
        let cancel = CancellationToken::new();

        assert!(matches!(
            coordinator.connect(DeviceId::Fcc1, &cancel).await,
            Err(DeviceError::NotInitialized)
        ));
        assert!(matches!(
            coordinator.connect_all(&cancel).await,
            Err(DeviceError::NotInitialized)
        ));
        assert!(matches!(
            coordinator.try_update_connection_config(DeviceId::Hil, "COM1", 9600, true),
            Err(DeviceError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (coordinator, _) = coordinator();
        coordinator.initialize().await.unwrap();
        let first = coordinator.connection(DeviceId::Fcc2).unwrap().unwrap();

        coordinator.initialize().await.unwrap();
        let second = coordinator.connection(DeviceId::Fcc2).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(coordinator.config_snapshot().devices.len(), DeviceId::ALL.len());
    }

    #[tokio::test]
    async fn test_connect_without_port_is_rejected() {
        let (coordinator, repository) = coordinator();
        coordinator.initialize().await.unwrap();

        assert!(!coordinator.connect(DeviceId::Fcc1, &CancellationToken::new()).await.unwrap());
        assert_eq!(coordinator.connection_state(DeviceId::Fcc1).unwrap(), ConnectionState::Disconnected);
        assert_eq!(repository.save_count(), 0);
    }

    #[tokio::test]
    async fn test_update_connection_config_reports_baud_only() {
        let (coordinator, _) = coordinator();
        coordinator.initialize().await.unwrap();

        assert!(coordinator
            .try_update_connection_config(DeviceId::Fcc3, " COM7 ", 57_600, true)
            .unwrap());
        let device = coordinator.device_config(DeviceId::Fcc3);
        assert_eq!(device.port, "COM7");
        assert_eq!(device.connection.baud_rate, 57_600);
        assert!(device.locked);

        // The mutation still happens when the baud rate is rejected.
        assert!(!coordinator
            .try_update_connection_config(DeviceId::Fcc3, "", -5, false)
            .unwrap());
        let device = coordinator.device_config(DeviceId::Fcc3);
        assert!(!device.has_port());
        assert_eq!(device.connection.baud_rate, 0);
        assert!(!device.locked);
        assert_eq!(device.connection_config().baud_rate, 115_200);
    }

    #[tokio::test]
    async fn test_retry_update_is_validated() {
        let (coordinator, _) = coordinator();
        coordinator.initialize().await.unwrap();

        let invalid = RetryPolicyConfig {
            connect_retry_count: 11,
            ..RetryPolicyConfig::default()
        };
        assert!(!coordinator.update_retry_policy(invalid).unwrap());
        assert_eq!(coordinator.config_snapshot().retry, RetryPolicyConfig::default());

        let valid = RetryPolicyConfig {
            connect_retry_count: 5,
            ..RetryPolicyConfig::default()
        };
        assert!(coordinator.update_retry_policy(valid).unwrap());
        assert_eq!(coordinator.config_snapshot().retry, valid);
    }

    #[tokio::test]
    async fn test_dispose_turns_operations_into_no_ops() {
        let (coordinator, _) = coordinator();
        coordinator.initialize().await.unwrap();
        let connection = coordinator.connection(DeviceId::Hil).unwrap().unwrap();

        coordinator.dispose();
        coordinator.dispose();

        assert!(connection.is_disposed());
        let cancel = CancellationToken::new();
        assert!(!coordinator.connect(DeviceId::Hil, &cancel).await.unwrap());
        assert!(!coordinator.turn_on(DeviceId::Hil, &cancel).await.unwrap());
        let all = coordinator.connect_all(&cancel).await.unwrap();
        assert_eq!(all.len(), DeviceId::ALL.len());
        assert!(all.values().all(|connected| !connected));
        assert!(coordinator.connection(DeviceId::Hil).unwrap().is_none());
    }
}
