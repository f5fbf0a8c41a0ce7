//! Client configuration
//!
//! Defaults cover every field, so a JSON file only needs the values it
//! overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ChatError, ChatResult};

/// Fifteen days in milliseconds
pub const DEFAULT_BUCKET_WIDTH_MS: i64 = 15 * 24 * 60 * 60 * 1000;

/// Default capacity for the client event broadcast channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunables for a [`crate::ChatClient`] and the message chain beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Width of one time bucket of the inbound message address space
    pub bucket_width_ms: i64,

    /// How many buckets (current, previous, ...) inbound discovery watches
    pub discovery_buckets: u32,

    /// Capacity of the broadcast channel handed to UI consumers
    pub event_channel_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: DEFAULT_BUCKET_WIDTH_MS,
            discovery_buckets: 2,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl ChatConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> ChatResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: ChatConfig =
            serde_json::from_str(&raw).map_err(|e| ChatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ChatResult<()> {
        if self.bucket_width_ms <= 0 {
            return Err(ChatError::Config(format!(
                "bucket_width_ms must be positive, got {}",
                self.bucket_width_ms
            )));
        }
        if self.discovery_buckets == 0 {
            return Err(ChatError::Config(
                "discovery_buckets must be at least 1".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ChatError::Config(
                "event_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
