//! Errors raised while loading and validating Talos configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by [`ConfigLoader`](crate::ConfigLoader) and
/// [`TalosConfig::validate`](crate::TalosConfig::validate).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// Failed to read configuration file.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML configuration: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("failed to parse JSON configuration: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The file extension or format name is neither `toml` nor `json`.
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A `.env` file exists but could not be parsed.
    #[error("failed to load .env file: {0}")]
    Dotenv(String),

    /// A field holds a value the engine cannot use.
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field with the invalid value.
        field: String,
        /// Explanation of why the value is invalid.
        reason: String,
    },

    /// Environment variable parsing error.
    #[error("failed to parse environment variable {var}: {reason}")]
    EnvParseError {
        /// The environment variable name.
        var: String,
        /// Explanation of the parsing error.
        reason: String,
    },
}

impl ConfigError {
    /// Create a new file not found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Create a new read error.
    pub fn read_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    /// Create a new invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a new environment variable parse error.
    pub fn env_parse_error(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_not_found_error() {
        let err = ConfigError::file_not_found("/path/to/talos.toml");
        assert!(err.to_string().contains("/path/to/talos.toml"));
    }

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigError::invalid_value("client.incoming_buffer_size", "must be greater than 0");
        assert!(err.to_string().contains("client.incoming_buffer_size"));
        assert!(err.to_string().contains("must be greater than 0"));
    }

    #[test]
    fn test_env_parse_error() {
        let err = ConfigError::env_parse_error("TALOS__CLIENT__REDIRECT_ENABLED", "expected boolean");
        assert!(err.to_string().contains("TALOS__CLIENT__REDIRECT_ENABLED"));
        assert!(err.to_string().contains("expected boolean"));
    }

    #[test]
    fn test_unsupported_format_error() {
        let err = ConfigError::UnsupportedFormat("talos.yaml".to_string());
        assert_eq!(err.to_string(), "unsupported configuration format: talos.yaml");
    }
}
