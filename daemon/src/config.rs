//! Daemon configuration

use anyhow::Result;
use edgews_transport::EngineConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load and merge configuration from file (incremental update)
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let other = Self::parse(&content)?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one (incremental)
    ///
    /// Rules:
    /// - Scalar values: overwrite if the new value differs from default
    /// - Option values: overwrite if Some
    pub fn merge(&mut self, other: DaemonConfig) {
        // Server config
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }

        // Engine config
        let defaults = EngineConfig::default();
        let engine = other.engine;
        if engine.read_buffer_size != defaults.read_buffer_size {
            self.engine.read_buffer_size = engine.read_buffer_size;
        }
        if engine.write_buffer_size != defaults.write_buffer_size {
            self.engine.write_buffer_size = engine.write_buffer_size;
        }
        if engine.connection_timeout_secs != defaults.connection_timeout_secs {
            self.engine.connection_timeout_secs = engine.connection_timeout_secs;
        }
        if engine.compression_enabled != defaults.compression_enabled {
            self.engine.compression_enabled = engine.compression_enabled;
        }
        if engine.compression_level.is_some() {
            self.engine.compression_level = engine.compression_level;
        }
        if engine.sweep_interval_ms != defaults.sweep_interval_ms {
            self.engine.sweep_interval_ms = engine.sweep_interval_ms;
        }
        if engine.queue_capacity != defaults.queue_capacity {
            self.engine.queue_capacity = engine.queue_capacity;
        }
        if engine.buffer_pool_size != defaults.buffer_pool_size {
            self.engine.buffer_pool_size = engine.buffer_pool_size;
        }
        if engine.max_message_size != defaults.max_message_size {
            self.engine.max_message_size = engine.max_message_size;
        }
        if engine.max_events != defaults.max_events {
            self.engine.max_events = engine.max_events;
        }

        // Monitoring
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
        if !other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = false;
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}
