//! # Configuration Management
//!
//! Centralized configuration for the secure stream.
//!
//! This module provides the session limits that drive rekeying and the
//! logging setup used by [`init_logging`](crate::utils::logging::init_logging).
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Session Limits
//! Both peers must run with the same [`SessionConfig`]. Limits are not
//! negotiated on the wire; a mismatch shows up as one side rejecting packets
//! the other considers legal.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Rekey after this many bytes have been sent and received under one key (1 GiB)
pub const REKEY_AFTER_BYTES: u64 = 1 << 30;

/// No traffic is accepted under one key past this many bytes
pub const REJECT_AFTER_BYTES: u64 = 2 * REKEY_AFTER_BYTES;

/// Largest length a single packet may declare
pub const MAX_PACKET_LENGTH: u64 = REJECT_AFTER_BYTES;

/// Size of the random material exchanged for key derivation and verification
pub const RANDOM_MATERIAL_LEN: usize = 64;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StreamConfig {
    /// Session key limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StreamConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_u64("SECURE_STREAM_REKEY_AFTER_BYTES")? {
            config.session.rekey_after_bytes = val;
        }

        if let Some(val) = env_u64("SECURE_STREAM_REJECT_AFTER_BYTES")? {
            config.session.reject_after_bytes = val;
        }

        if let Some(val) = env_u64("SECURE_STREAM_MAX_PACKET_LENGTH")? {
            config.session.max_packet_length = val;
        }

        if let Ok(level) = std::env::var("SECURE_STREAM_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid log level: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.session.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        validation_result(self.validate())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid value for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

fn validation_result(errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

/// Byte limits for one session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Soft threshold: rekey once this many bytes went through the current key
    pub rekey_after_bytes: u64,

    /// Hard ceiling: nothing more is sent or accepted under the current key
    pub reject_after_bytes: u64,

    /// Largest length a single packet may declare
    pub max_packet_length: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_after_bytes: REKEY_AFTER_BYTES,
            reject_after_bytes: REJECT_AFTER_BYTES,
            max_packet_length: MAX_PACKET_LENGTH,
        }
    }
}

impl SessionConfig {
    /// Limits scaled from a single soft threshold, keeping the default ratios
    pub fn with_rekey_after(rekey_after_bytes: u64) -> Self {
        let reject_after_bytes = rekey_after_bytes.saturating_mul(2);
        Self {
            rekey_after_bytes,
            reject_after_bytes,
            max_packet_length: reject_after_bytes,
        }
    }

    /// Validate session limits
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.rekey_after_bytes == 0 {
            errors.push("Rekey threshold must be greater than 0".to_string());
        }

        if self.reject_after_bytes <= self.rekey_after_bytes {
            errors.push(format!(
                "Reject threshold ({}) must be greater than rekey threshold ({})",
                self.reject_after_bytes, self.rekey_after_bytes
            ));
        }

        if self.max_packet_length == 0 {
            errors.push("Max packet length cannot be 0".to_string());
        } else if self.max_packet_length > self.reject_after_bytes {
            errors.push(format!(
                "Max packet length ({}) cannot exceed reject threshold ({})",
                self.max_packet_length, self.reject_after_bytes
            ));
        }

        // Room for the handshake: a sealed 64-byte challenge plus framing
        if self.reject_after_bytes < 4 * RANDOM_MATERIAL_LEN as u64 {
            errors.push(format!(
                "Reject threshold too small: {} bytes (minimum: {})",
                self.reject_after_bytes,
                4 * RANDOM_MATERIAL_LEN
            ));
        }

        errors
    }

    pub fn validate_strict(&self) -> Result<()> {
        validation_result(self.validate())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("secure-stream"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
