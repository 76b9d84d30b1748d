/*!
 * Prelude module for SerialFlow Core.
 *
 * Re-exports the commonly used types so downstream crates can pull them in
 * with a single import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Parity, StopBits, TextEncoding, Timestamp};

// Re-export event types
pub use crate::event::{EventBus, EventReceiver, SharedEventBus, Tagged};

// Re-export config types
pub use crate::config::{
    AppConfig, ConfigBuilder, ConfigRepository, ConnectionConfig, DeviceConfig,
    FileConfigRepository, InMemoryConfigRepository, LoggingConfig, RetryPolicyConfig,
};

// Re-export utility functions
pub use crate::utils::{backoff_delay, cancellable_sleep, run_blocking, with_cancellation};

// Re-export cancellation
pub use tokio_util::sync::CancellationToken;

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
