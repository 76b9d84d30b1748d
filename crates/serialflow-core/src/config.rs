/*!
 * Configuration management for SerialFlow.
 *
 * This module provides the configuration model (connection settings, retry
 * settings and per-device settings), loading through layered sources, and the
 * repository boundary used to persist a configuration snapshot.
 */
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Parity, StopBits, TextEncoding};

/// Baud rate used when none (or zero) is configured
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
/// Data bits used when the configured value is out of range
pub const DEFAULT_DATA_BITS: u8 = 8;
/// Read/write timeout used when none is configured
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Allowed range for both retry counts
pub const RETRY_COUNT_RANGE: std::ops::RangeInclusive<u32> = 0..=10;
/// Allowed range for the backoff base delay
pub const BASE_DELAY_RANGE_MS: std::ops::RangeInclusive<u64> = 50..=5000;

/// Settings for one serial line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Port identifier (`COM3`, `/dev/ttyUSB0`, ...)
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Parity mode
    pub parity: Parity,
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Text encoding used on the line
    pub encoding: TextEncoding,
    /// Read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            data_bits: DEFAULT_DATA_BITS,
            stop_bits: StopBits::One,
            encoding: TextEncoding::Utf8,
            read_timeout_ms: DEFAULT_TIMEOUT_MS,
            write_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    /// Create a config for a port with default line settings
    pub fn new<S: Into<String>>(port_name: S) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Check the parameters a connection refuses to open with
    pub fn validate(&self) -> Result<()> {
        if self.port_name.trim().is_empty() {
            return Err(Error::config("port name is empty"));
        }
        if self.baud_rate == 0 {
            return Err(Error::config("baud rate must be positive"));
        }
        if self.data_bits == 0 {
            return Err(Error::config("data bits must be positive"));
        }
        Ok(())
    }

    /// Whether the config can be used to open a port
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Fill zero or out-of-range numeric fields with defaults
    pub fn normalized(mut self) -> Self {
        self.port_name = self.port_name.trim().to_string();
        if self.baud_rate == 0 {
            self.baud_rate = DEFAULT_BAUD_RATE;
        }
        if !(5..=8).contains(&self.data_bits) {
            self.data_bits = DEFAULT_DATA_BITS;
        }
        if self.read_timeout_ms == 0 {
            self.read_timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        if self.write_timeout_ms == 0 {
            self.write_timeout_ms = DEFAULT_TIMEOUT_MS;
        }
        self
    }

    /// Read timeout as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Retry settings shared by every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Retries after the first failed open
    pub connect_retry_count: u32,
    /// Retries after the first failed write
    pub send_retry_count: u32,
    /// Delay before the first retry, doubled on each further retry
    pub base_delay_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            connect_retry_count: 3,
            send_retry_count: 2,
            base_delay_ms: 200,
        }
    }
}

impl RetryPolicyConfig {
    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<()> {
        if !RETRY_COUNT_RANGE.contains(&self.connect_retry_count) {
            return Err(Error::config(format!(
                "connect retry count {} outside {:?}",
                self.connect_retry_count, RETRY_COUNT_RANGE
            )));
        }
        if !RETRY_COUNT_RANGE.contains(&self.send_retry_count) {
            return Err(Error::config(format!(
                "send retry count {} outside {:?}",
                self.send_retry_count, RETRY_COUNT_RANGE
            )));
        }
        if !BASE_DELAY_RANGE_MS.contains(&self.base_delay_ms) {
            return Err(Error::config(format!(
                "base delay {}ms outside {:?}",
                self.base_delay_ms, BASE_DELAY_RANGE_MS
            )));
        }
        Ok(())
    }

    /// Force every field into its allowed range
    pub fn clamped(self) -> Self {
        Self {
            connect_retry_count: self
                .connect_retry_count
                .clamp(*RETRY_COUNT_RANGE.start(), *RETRY_COUNT_RANGE.end()),
            send_retry_count: self
                .send_retry_count
                .clamp(*RETRY_COUNT_RANGE.start(), *RETRY_COUNT_RANGE.end()),
            base_delay_ms: self
                .base_delay_ms
                .clamp(*BASE_DELAY_RANGE_MS.start(), *BASE_DELAY_RANGE_MS.end()),
        }
    }

    /// Base delay as a duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Settings for one device slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name of the device
    pub name: String,
    /// Selected port, empty when unconfigured
    pub port: String,
    /// Whether the port selection is locked (eligible for connect-all)
    pub locked: bool,
    /// Line settings
    pub connection: ConnectionConfig,
    /// Command that switches the device on
    pub on_command: Option<String>,
    /// Command that switches the device off
    pub off_command: Option<String>,
}

impl DeviceConfig {
    /// Create an unconfigured device entry
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Whether a port has been selected
    pub fn has_port(&self) -> bool {
        !self.port.trim().is_empty()
    }

    /// Connection settings for the selected port with defaults filled in
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            port_name: self.port.clone(),
            ..self.connection.clone()
        }
        .normalized()
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error or a directive list)
    pub level: String,
    /// Whether to print the event target
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

/// Application configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Retry configuration
    pub retry: RetryPolicyConfig,
    /// Per-device settings keyed by device name
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl AppConfig {
    /// Look up a device entry; keys are matched case-insensitively
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, device)| device)
    }

    /// Mutable device entry, created with defaults when missing
    pub fn device_mut(&mut self, name: &str) -> &mut DeviceConfig {
        let key = self
            .devices
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());

        let entry = self
            .devices
            .entry(key)
            .or_insert_with(|| DeviceConfig::named(name));
        if entry.name.is_empty() {
            entry.name = name.to_string();
        }
        entry
    }
}

/// A builder for loading an [`AppConfig`] from layered sources
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<PathBuf>,
    environment_prefix: Option<String>,
    override_with: Option<AppConfig>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path (format picked from the extension)
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: AppConfig) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let mut builder = ConfigLib::builder();

        let defaults = AppConfig::default();
        builder = builder.add_source(
            ConfigLib::try_from(&defaults)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(path) = self.config_file {
            if path.exists() {
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(File::from(path.as_path()));
            } else {
                debug!("Configuration file {} does not exist, using defaults", path.display());
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: AppConfig = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// Persistence boundary for configuration snapshots
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    /// Load the current snapshot
    async fn load(&self) -> Result<AppConfig>;

    /// Persist a snapshot
    async fn save(&self, config: &AppConfig) -> Result<()>;
}

/// Repository that keeps the snapshot in memory
#[derive(Debug, Default)]
pub struct InMemoryConfigRepository {
    config: Mutex<AppConfig>,
    saves: AtomicUsize,
}

impl InMemoryConfigRepository {
    /// Create a repository seeded with a snapshot
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Last saved (or seeded) snapshot
    pub async fn snapshot(&self) -> AppConfig {
        self.config.lock().await.clone()
    }
}

#[async_trait]
impl ConfigRepository for InMemoryConfigRepository {
    async fn load(&self) -> Result<AppConfig> {
        Ok(self.config.lock().await.clone())
    }

    async fn save(&self, config: &AppConfig) -> Result<()> {
        *self.config.lock().await = config.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Repository backed by a TOML or JSON file
#[derive(Debug, Clone)]
pub struct FileConfigRepository {
    path: PathBuf,
    environment_prefix: Option<String>,
}

impl FileConfigRepository {
    /// Create a repository for the given file
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            environment_prefix: None,
        }
    }

    /// Let environment variables override values read from the file
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_json(&self) -> bool {
        self.path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConfigRepository for FileConfigRepository {
    async fn load(&self) -> Result<AppConfig> {
        let mut builder = ConfigBuilder::new().with_config_file(&self.path);
        if let Some(prefix) = &self.environment_prefix {
            builder = builder.with_environment_prefix(prefix);
        }
        builder.build()
    }

    async fn save(&self, config: &AppConfig) -> Result<()> {
        let contents = if self.is_json() {
            serde_json::to_string_pretty(config)?
        } else {
            toml::to_string_pretty(config)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, contents).await?;
        debug!("Configuration saved to {}", self.path.display());
        Ok(())
    }
}
