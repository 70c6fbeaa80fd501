//! Configuration file support for vportd
//!
//! Loads and validates registry configuration from TOML files.
//! Default location: /etc/openvswitch/vportd.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::entry::MAX_DP_PORTS;
use crate::error::{Result, VportError};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/openvswitch/vportd.toml";

/// How a name query resolves its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameLookup {
    /// Match against the datapath-assigned name.
    #[default]
    OvsName,
    /// Match against the fabric's port friendly name.
    HypervisorName,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Datapath number reported in query records
    #[serde(default)]
    pub datapath_no: u32,

    /// Initial bucket count of each index (rounded up to a power of two)
    #[serde(default = "default_index_capacity")]
    pub index_capacity: usize,

    /// Maximum number of vports, singletons and tunnels included
    #[serde(default = "default_max_vports")]
    pub max_vports: usize,

    /// Maximum time a NIC notification waits for switch activation
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_ms: u64,

    /// Key used by name queries
    #[serde(default)]
    pub name_lookup: NameLookup,

    /// Log filter directive (tracing EnvFilter syntax)
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_index_capacity() -> usize {
    1024
}

fn default_max_vports() -> usize {
    4096
}

fn default_activation_timeout() -> u64 {
    5000
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            datapath_no: 0,
            index_capacity: default_index_capacity(),
            max_vports: default_max_vports(),
            activation_timeout_ms: default_activation_timeout(),
            name_lookup: NameLookup::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl RegistryConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| VportError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map_err(|e| match e {
                VportError::Config(msg) => {
                    VportError::Config(format!("{}: {}", path.display(), msg))
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(VportError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VportError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Index bucket count actually used
    pub fn buckets(&self) -> usize {
        self.index_capacity.max(1).next_power_of_two()
    }

    pub fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.activation_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.index_capacity == 0 {
            return Err(VportError::Config("index_capacity must be > 0".to_string()));
        }
        if self.max_vports == 0 || self.max_vports > MAX_DP_PORTS as usize {
            return Err(VportError::Config(format!(
                "max_vports must be 1-{}",
                MAX_DP_PORTS
            )));
        }
        if self.activation_timeout_ms == 0 {
            return Err(VportError::Config(
                "activation_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
