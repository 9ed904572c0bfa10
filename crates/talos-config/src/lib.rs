//! Typed configuration for the Talos WebSocket client engine.
//!
//! This crate provides:
//! - TOML and JSON configuration files
//! - Environment variable overrides
//! - Strict validation (fails on unknown fields)
//! - Layered configuration (defaults → file → env)
//!
//! # Example
//!
//! ```no_run
//! use talos_config::ConfigLoader;
//!
//! # fn main() -> Result<(), talos_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_file("talos.toml")?
//!     .with_env_prefix("TALOS")
//!     .load()?;
//!
//! println!("redirects enabled: {}", config.client.redirect_enabled);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [client]
//! incoming_buffer_size = 4194315
//! redirect_enabled = true
//! handshake_timeout_ms = 30000
//! subprotocols = ["chat"]
//!
//! [client.credentials]
//! username = "user1"
//! password = "password"
//!
//! [[client.extensions]]
//! name = "permessage-deflate"
//! parameters = [{ name = "client_max_window_bits" }]
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! # Environment Variable Overrides
//!
//! Values can be overridden with variables of the form `PREFIX__SECTION__KEY`:
//!
//! - `TALOS__CLIENT__INCOMING_BUFFER_SIZE=65536`
//! - `TALOS__CLIENT__CREDENTIALS__USERNAME=user1`
//! - `TALOS__LOGGING__FORMAT=pretty`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
