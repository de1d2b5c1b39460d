//! Configuration loading

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use relay_core::{HeartbeatConfig, MAX_DATAGRAM_SIZE};
use serde::{Deserialize, Serialize};

/// Main configuration for the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP bridge listens on
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Address the UDP endpoint binds to
    #[serde(default = "default_udp_bind")]
    pub udp_bind: String,

    /// Time to collect device output before answering a bridge request
    #[serde(default = "default_collection_window_ms")]
    pub collection_window_ms: u64,

    /// Receive buffer size; longer datagrams are truncated
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,

    /// Heartbeat monitoring
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Tick interval in milliseconds (default: 1s)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    /// Ticks without a heartbeat before the target is reported not ready
    #[serde(default = "default_max_wait_count")]
    pub max_wait_count: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            max_wait_count: default_max_wait_count(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_udp_bind() -> String {
    "0.0.0.0:4444".to_string()
}

fn default_collection_window_ms() -> u64 {
    1000
}

fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_max_wait_count() -> u32 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            udp_bind: default_udp_bind(),
            collection_window_ms: default_collection_window_ms(),
            max_datagram_size: default_max_datagram_size(),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, or use defaults when no file is given.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let Some(config_file) = config_file else {
            tracing::info!("No config file given, using defaults");
            return Ok(Config::default());
        };

        let content = std::fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Invalid config file: {:?}", config_file))?;
        tracing::info!("Loaded configuration from {:?}", config_file);
        Ok(config)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.collection_window_ms == 0 {
            bail!("collection_window_ms must be greater than 0");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be greater than 0");
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            bail!(
                "max_datagram_size must be between 1 and {}, got {}",
                MAX_DATAGRAM_SIZE,
                self.max_datagram_size
            );
        }
        Ok(())
    }

    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            max_wait_count: self.heartbeat.max_wait_count,
        }
    }
}
