//! Configuration sections
//!
//! Each section deserializes with defaults for every missing field, so a
//! partial file only overrides what it names.

use super::{
    DEFAULT_IDLE_SLEEP_US, DEFAULT_LISTENER_QUEUE_SIZE, DEFAULT_LISTENER_START_TIMEOUT_MS,
    DEFAULT_LISTENER_STOP_TIMEOUT_MS, DEFAULT_MAX_BATCH, DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::alias::OutOfRangePolicy;
use crate::link::LinkParams;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which transport to use and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// One of the names from [`crate::link::available_link_types`]
    pub kind: String,
    pub params: LinkParams,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            kind: "dummy".to_string(),
            params: LinkParams::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Capacity of the bounded queue, in batches
    pub queue_size: usize,
    /// Hard limit on how long `start()` waits for setup
    pub start_timeout_ms: u64,
    /// How long `stop()` waits before abandoning the consumer thread
    pub stop_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_LISTENER_QUEUE_SIZE,
            start_timeout_ms: DEFAULT_LISTENER_START_TIMEOUT_MS,
            stop_timeout_ms: DEFAULT_LISTENER_STOP_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Time the device gets to acknowledge a write before it is failed
    pub timeout_ms: u64,
    /// What to do with alias writes outside `[min, max]`
    pub out_of_range: OutOfRangePolicy,
}

impl WriteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            out_of_range: OutOfRangePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sleep between loop iterations when there was nothing to do
    pub idle_sleep_us: u64,
    /// Most value updates broadcast in a single call
    pub max_batch: usize,
}

impl SyncConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_us)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_sleep_us: DEFAULT_IDLE_SLEEP_US,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}
