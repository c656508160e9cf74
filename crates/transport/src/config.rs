//! Engine configuration

use edgews_protocol::DEFAULT_COMPRESSION_LEVEL;
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Bytes per socket read
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,

    /// Initial capacity of outbound frame buffers
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,

    /// Idle eviction threshold in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Offer permessage-deflate to clients that ask for it
    #[serde(default)]
    pub compression_enabled: bool,

    /// Deflate level 0-9; unset means best compression
    #[serde(default)]
    pub compression_level: Option<u32>,

    /// Eviction sweep period in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Capacity of each drain queue
    #[serde(default = "default_capacity")]
    pub queue_capacity: usize,

    /// Number of preallocated buffers in the arena
    #[serde(default = "default_capacity")]
    pub buffer_pool_size: usize,

    /// Upper bound on an inflated message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Readiness events fetched per wait call
    #[serde(default = "default_capacity")]
    pub max_events: usize,
}

fn default_buffer_size() -> usize {
    1024
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_capacity() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

impl EngineConfig {
    /// Effective deflate level
    pub fn compression_level(&self) -> u32 {
        self.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL).min(9)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            connection_timeout_secs: default_connection_timeout(),
            compression_enabled: false,
            compression_level: None,
            sweep_interval_ms: default_sweep_interval(),
            queue_capacity: default_capacity(),
            buffer_pool_size: default_capacity(),
            max_message_size: default_max_message_size(),
            max_events: default_capacity(),
        }
    }
}
