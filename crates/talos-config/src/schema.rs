//! Configuration schema types.
//!
//! This module defines the structure of all configuration sections.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client engine configuration section.
///
/// These are the knobs the transport container hands to the client engine:
/// buffer limits, redirect policy, credentials for HTTP authentication and the
/// handshake timeout the container enforces.
///
/// # Example
///
/// ```
/// use talos_config::ClientConfig;
///
/// let config = ClientConfig {
///     redirect_enabled: true,
///     ..Default::default()
/// };
/// assert_eq!(config.incoming_buffer_size, None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Maximum size of the incoming frame buffer in bytes. `None` defers to
    /// the container override or the engine default.
    #[serde(default)]
    pub incoming_buffer_size: Option<usize>,

    /// Whether HTTP 3xx responses to the upgrade request are followed.
    #[serde(default)]
    pub redirect_enabled: bool,

    /// Handshake timeout in milliseconds, enforced by the container.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Credentials used to answer an HTTP 401 challenge.
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in preference order.
    #[serde(default)]
    pub subprotocols: Vec<String>,

    /// Extensions offered in `Sec-WebSocket-Extensions`, in preference order.
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            incoming_buffer_size: None,
            redirect_enabled: false,
            handshake_timeout_ms: default_handshake_timeout(),
            credentials: None,
            subprotocols: Vec::new(),
            extensions: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// The handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_handshake_timeout() -> u64 {
    30_000
}

/// Username/password pair for HTTP authentication.
///
/// The password is never printed by the `Debug` implementation.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Username (must not be empty).
    pub username: String,

    /// Password.
    pub password: String,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An extension offer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Extension token as sent on the wire (e.g. `permessage-deflate`).
    pub name: String,

    /// Extension parameters in the order they are offered.
    #[serde(default)]
    pub parameters: Vec<ExtensionParameterConfig>,
}

/// A single extension parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionParameterConfig {
    /// Parameter name.
    pub name: String,

    /// Parameter value; `None` for flag parameters.
    #[serde(default)]
    pub value: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable log output.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive (e.g., "info", "talos_ws=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include source file and line in each event.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: false,
        }
    }
}

impl LoggingConfig {
    /// Convert into the telemetry crate's logging configuration.
    pub fn to_log_config(&self) -> talos_telemetry::LogConfig {
        talos_telemetry::LogConfig {
            enabled: self.enabled,
            level: self.level.clone(),
            json_format: self.format == LogFormat::Json,
            include_location: self.include_location,
            ..talos_telemetry::LogConfig::default()
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
