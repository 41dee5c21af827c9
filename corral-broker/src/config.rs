//! Broker configuration, optionally read from a TOML file.
//!
//! ```toml
//! [broker]
//! init-timeout-ms = 10000
//! call-timeout-ms = 60000
//! max-per-origin = 100
//! ```

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Host-supplied broker parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokerConfig {
    /// How long `initialize` waits for the handshake to complete.
    pub init_timeout_ms: u64,
    /// Deadline applied to calls that do not carry their own.
    pub call_timeout_ms: u64,
    /// Maximum concurrent in-flight calls per origin.
    pub max_per_origin: usize,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    /// How many terminated job ids are remembered to answer `Terminated`
    /// instead of `JobNotFound`.
    pub tombstone_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 10_000,
            call_timeout_ms: 60_000,
            max_per_origin: 100,
            event_capacity: 256,
            tombstone_capacity: 1024,
        }
    }
}

/// Raw TOML structure matching the config file format.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    broker: BrokerConfig,
}

impl BrokerConfig {
    /// Parses a config document, rejecting invalid values.
    pub fn from_toml_str(contents: &str) -> BrokerResult<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| BrokerError::Config(e.to_string()))?;
        file.broker.validate()?;
        Ok(file.broker)
    }

    /// Loads config from `path`.
    /// Falls back to defaults with a warning when the file is unreadable or invalid.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No broker config found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded broker config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Invalid broker config {:?}: {}. Using defaults.", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read broker config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Checks that every limit is usable.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.init_timeout_ms == 0 {
            return Err(BrokerError::Config("init-timeout-ms must be > 0".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(BrokerError::Config("call-timeout-ms must be > 0".into()));
        }
        if self.max_per_origin == 0 {
            return Err(BrokerError::Config("max-per-origin must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(BrokerError::Config("event-capacity must be > 0".into()));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
