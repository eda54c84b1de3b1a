//! Configuration of the secure channel layer, with YAML persistence.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use uasc_core::comms::tcp_types::MIN_CHUNK_SIZE;
use uasc_types::constants;

/// Failure loading or saving a configuration file.
#[derive(Debug, ThisError)]
pub enum ConfigError {
    /// The configuration content is invalid.
    #[error("configuration is invalid: {0:?}")]
    Invalid(Vec<String>),
    /// Reading or writing the file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The file is not valid YAML for this configuration.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration of a server's secure channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// The largest chunk the server will accept, also offered to the client
    /// as the chunk size for its responses.
    pub receive_buffer_size: usize,
    /// The largest chunk the server will send.
    pub send_buffer_size: usize,
    /// The largest whole message accepted in either direction, 0 for no
    /// limit.
    pub max_message_size: usize,
    /// The most chunks per message accepted in either direction, 0 for no
    /// limit.
    pub max_chunk_count: usize,
    /// How long in milliseconds a freshly accepted connection may take to
    /// deliver its hello and first open secure channel request before the
    /// server hangs up.
    pub open_timeout_ms: u64,
    /// The token lifetime granted when the client requests zero, and the cap
    /// applied to what the client requests, in milliseconds.
    pub default_token_lifetime_ms: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            receive_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: constants::MAX_MESSAGE_SIZE,
            max_chunk_count: constants::MAX_CHUNK_COUNT,
            open_timeout_ms: 10_000,
            default_token_lifetime_ms: 600_000,
        }
    }
}

impl ChannelConfig {
    /// Load a configuration from a YAML file, validating it on the way in.
    pub fn load(path: &Path) -> Result<ChannelConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ChannelConfig = serde_yaml::from_str(&content)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Save the configuration to a YAML file. Invalid configurations are
    /// refused rather than written out.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate().map_err(ConfigError::Invalid)?;
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.receive_buffer_size < MIN_CHUNK_SIZE {
            errors.push(format!(
                "receive_buffer_size must be at least {}",
                MIN_CHUNK_SIZE
            ));
        }
        if self.send_buffer_size < MIN_CHUNK_SIZE {
            errors.push(format!(
                "send_buffer_size must be at least {}",
                MIN_CHUNK_SIZE
            ));
        }
        if self.open_timeout_ms == 0 {
            errors.push("open_timeout_ms must be greater than zero".to_string());
        }
        if self.default_token_lifetime_ms == 0 {
            errors.push("default_token_lifetime_ms must be greater than zero".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The initial-open deadline as a duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}
