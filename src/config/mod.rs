//! Configuration module
//!
//! Handles loading and saving Labnode client configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{ConnectionOptions, ReconnectPolicy, SerialOptions, TransportConfig};
use crate::protocol::{DEFAULT_ID_SPACE, DEFAULT_MAX_PAYLOAD, MAX_ID_SPACE, MAX_PAYLOAD_LIMIT};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Which device to talk to and how
    #[serde(default)]
    pub transport: TransportConfig,

    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Reconnection after a lost link
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Protocol limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Time allowed for opening the transport in ms
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,
    /// Time to wait for a reply in ms
    #[serde(default = "default_timeout")]
    pub request_timeout_ms: u64,
}

fn default_timeout() -> u64 {
    2500
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_timeout(),
            request_timeout_ms: default_timeout(),
        }
    }
}

/// Protocol limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Number of correlation ids the device supports
    #[serde(default = "default_id_space")]
    pub id_space: u16,
    /// Largest payload accepted in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_id_space() -> u16 {
    DEFAULT_ID_SPACE
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            id_space: default_id_space(),
            max_payload: default_max_payload(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Locations searched by [`load_default`](Self::load_default), in order
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|p| p.join("labnode/config.toml")),
            Some(PathBuf::from("./labnode.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        for path in Self::default_paths() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(&path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject values the connection layer cannot work with
    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_ID_SPACE).contains(&self.limits.id_space) {
            return Err(ConfigError::Invalid {
                field: "limits.id_space",
                reason: format!("must be 1-{}, got {}", MAX_ID_SPACE, self.limits.id_space),
            });
        }
        if self.limits.max_payload == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.max_payload",
                reason: "must be positive".to_string(),
            });
        }
        if self.limits.max_payload > MAX_PAYLOAD_LIMIT {
            return Err(ConfigError::Invalid {
                field: "limits.max_payload",
                reason: format!(
                    "must fit a 4-byte length prefix ({} max), got {}",
                    MAX_PAYLOAD_LIMIT, self.limits.max_payload
                ),
            });
        }
        if self.timeouts.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timeouts.request_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        let multiplier = self.reconnect.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                field: "reconnect.multiplier",
                reason: format!("must be a finite number >= 1, got {}", multiplier),
            });
        }
        Ok(())
    }

    /// Runtime options for a [`ConnectionManager`](crate::network::ConnectionManager)
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: Duration::from_millis(self.timeouts.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.timeouts.connect_timeout_ms),
            id_space: self.limits.id_space,
            max_payload: self.limits.max_payload,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        transport: TransportConfig::serial("/dev/ttyACM0", SerialOptions::default()),
        reconnect: ReconnectPolicy::enabled().with_max_attempts(10),
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
