//! Logging bootstrap for Talos.
//!
//! The engine crates only emit `tracing` events; this crate decides where
//! they go. Applications (and test suites) call [`init_logging`] once at
//! startup with a [`LogConfig`], usually derived from the `[logging]` section
//! of the Talos configuration file.
//!
//! # Example
//!
//! ```rust,ignore
//! use talos_telemetry::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::development())?;
//! tracing::info!(uri = "ws://localhost:8080/echo", "Connecting");
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod logging;

pub use error::TelemetryError;
pub use logging::{create_env_filter, init_logging, init_test_logging, LogConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
