//! Root configuration type.
//!
//! This module provides the top-level [`TalosConfig`] struct and its builder.

use serde::{Deserialize, Serialize};

use crate::{ClientConfig, ConfigError, LogFormat, LoggingConfig};

/// Smallest incoming buffer that can hold a frame header plus a control frame.
pub const MIN_INCOMING_BUFFER_SIZE: usize = 256;

/// Complete Talos configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load it from files and
/// environment variables.
///
/// # Example
///
/// ```
/// use talos_config::TalosConfig;
///
/// let config = TalosConfig::default();
/// assert!(!config.client.redirect_enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct TalosConfig {
    /// Client engine configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TalosConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> TalosConfigBuilder {
        TalosConfigBuilder::new()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `client.incoming_buffer_size` is below [`MIN_INCOMING_BUFFER_SIZE`]
    /// - `client.handshake_timeout_ms` is zero
    /// - `client.credentials.username` is empty
    /// - an extension or subprotocol name is empty
    /// - `logging.level` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(size) = self.client.incoming_buffer_size {
            if size < MIN_INCOMING_BUFFER_SIZE {
                return Err(ConfigError::invalid_value(
                    "client.incoming_buffer_size",
                    format!("must be at least {MIN_INCOMING_BUFFER_SIZE} bytes, got {size}"),
                ));
            }
        }

        if self.client.handshake_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "client.handshake_timeout_ms",
                "must be greater than zero",
            ));
        }

        if let Some(credentials) = &self.client.credentials {
            if credentials.username.is_empty() {
                return Err(ConfigError::invalid_value(
                    "client.credentials.username",
                    "must not be empty",
                ));
            }
        }

        if self.client.subprotocols.iter().any(String::is_empty) {
            return Err(ConfigError::invalid_value(
                "client.subprotocols",
                "subprotocol names must not be empty",
            ));
        }

        if let Some(ext) = self.client.extensions.iter().find(|e| e.name.trim().is_empty()) {
            return Err(ConfigError::invalid_value(
                "client.extensions",
                format!("extension name must not be empty ({} parameters)", ext.parameters.len()),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value("logging.level", "must not be empty"));
        }

        Ok(())
    }

    /// Development preset: pretty debug logs with source locations.
    ///
    /// # Example
    ///
    /// ```
    /// use talos_config::TalosConfig;
    ///
    /// let config = TalosConfig::development();
    /// assert_eq!(config.logging.level, "debug");
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.logging.level = "debug".to_string();
        config.logging.format = LogFormat::Pretty;
        config.logging.include_location = true;
        config
    }

    /// Production preset: JSON logs at info level.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.logging.level = "info".to_string();
        config.logging.format = LogFormat::Json;
        config
    }
}

/// Builder for [`TalosConfig`].
#[derive(Debug, Default)]
pub struct TalosConfigBuilder {
    client: Option<ClientConfig>,
    logging: Option<LoggingConfig>,
}

impl TalosConfigBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client configuration.
    #[must_use]
    pub fn client(mut self, client: ClientConfig) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the logging configuration.
    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Build the configuration.
    ///
    /// Sections that were not set use their defaults.
    #[must_use]
    pub fn build(self) -> TalosConfig {
        TalosConfig {
            client: self.client.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CredentialsConfig, ExtensionConfig};

    #[test]
    fn test_default_validates() {
        assert!(TalosConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TalosConfig::builder()
            .client(ClientConfig {
                redirect_enabled: true,
                incoming_buffer_size: Some(8192),
                ..Default::default()
            })
            .build();

        assert!(config.client.redirect_enabled);
        assert_eq!(config.client.incoming_buffer_size, Some(8192));
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_validate_buffer_too_small() {
        let mut config = TalosConfig::default();
        config.client.incoming_buffer_size = Some(16);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client.incoming_buffer_size"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = TalosConfig::default();
        config.client.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_username() {
        let mut config = TalosConfig::default();
        config.client.credentials = Some(CredentialsConfig {
            username: String::new(),
            password: "secret".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_extension_name() {
        let mut config = TalosConfig::default();
        config.client.extensions.push(ExtensionConfig {
            name: " ".to_string(),
            parameters: Vec::new(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(TalosConfig::development().logging.format, LogFormat::Pretty);
        assert_eq!(TalosConfig::production().logging.format, LogFormat::Json);
    }
}
