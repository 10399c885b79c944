//! Configuration module for watchlink-rs
//!
//! [`CoreConfig`] gathers everything the synchronization core needs:
//!
//! - `link` - transport kind and its flat parameter map
//! - `listener` - queue size and start/stop timeouts
//! - `write` - device acknowledgement timeout and out-of-range policy
//! - `sync` - I/O loop pacing
//!
//! Files may be JSON or TOML, picked by extension. Missing fields take their
//! defaults.
//!
//! # Example
//!
//! ```toml
//! [link]
//! kind = "udp"
//! params = { host = "192.168.1.20", port = 8765 }
//!
//! [write]
//! out_of_range = "reject"
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{Result, WatchError};
use crate::link;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default listener queue capacity, in batches
pub const DEFAULT_LISTENER_QUEUE_SIZE: usize = 1000;

/// Default bound on listener setup
pub const DEFAULT_LISTENER_START_TIMEOUT_MS: u64 = 2000;

/// Default bound on listener shutdown
pub const DEFAULT_LISTENER_STOP_TIMEOUT_MS: u64 = 2000;

/// Default time the device has to acknowledge a write
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;

/// Default idle sleep of the I/O loop in microseconds
pub const DEFAULT_IDLE_SLEEP_US: u64 = 500;

/// Default maximum number of updates per broadcast
pub const DEFAULT_MAX_BATCH: usize = 256;

/// Complete configuration of the synchronization core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub link: LinkSettings,
    pub listener: ListenerConfig,
    pub write: WriteConfig,
    pub sync: SyncConfig,
}

impl CoreConfig {
    /// Load from a `.json` or `.toml` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WatchError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        if is_toml {
            Self::from_toml_str(&content)
        } else {
            serde_json::from_str(&content).map_err(|e| {
                WatchError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| WatchError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    /// Load a config file, falling back to defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Save as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WatchError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| WatchError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            WatchError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check the link section and the numeric limits
    pub fn validate(&self) -> Result<()> {
        link::validate_link_config(&self.link.kind, &self.link.params)?;
        if self.listener.queue_size == 0 {
            return Err(WatchError::Config("listener.queue_size must be at least 1".into()));
        }
        if self.sync.max_batch == 0 {
            return Err(WatchError::Config("sync.max_batch must be at least 1".into()));
        }
        Ok(())
    }
}
