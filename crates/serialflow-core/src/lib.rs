/*!
 * SerialFlow Core
 *
 * This crate provides the shared foundation for the SerialFlow system:
 * the configuration model and its persistence boundary, the typed event bus,
 * logging setup, and small async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use async_trait;
    pub use chrono;
    pub use futures;
    pub use tokio;
    pub use tokio_util;
    pub use tracing;
}

/// SerialFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("SerialFlow Core {} initialized", VERSION);
    Ok(())
}
