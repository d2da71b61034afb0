//! # Configuration
//!
//! TOML configuration for the gateway binary. Every section and field has a
//! default, so a partial file (or an empty one) is valid:
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//!
//! [gateway]
//! reply_timeout_ms = 1000
//! max_attempts = 3
//! stale_pending_ms = 15000
//! sweep_interval_ms = 5000
//! tick_interval_ms = 10
//! default_secret_key = "123"
//! known_devices = []
//! discover_on_start = true
//!
//! [uplink]
//! metric_queue_capacity = 100
//! flush_interval_ms = 10
//!
//! [logging]
//! level = "info"
//! file = "zbgateway.log"
//! ```
//!
//! ```rust,no_run
//! use zbgateway::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Serial port: {}", config.serial.port);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::gateway::frame::DEFAULT_SECRET_KEY;
use crate::validation::{validate_device_id, validate_secret_key};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub gateway: GatewayConfig,
    pub uplink: UplinkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Protocol engine timing and bootstrap parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-attempt wait for a matching reply.
    pub reply_timeout_ms: u64,
    /// Send attempts per command, first transmission included.
    pub max_attempts: u32,
    /// Pending devices unseen for longer than this are evicted.
    pub stale_pending_ms: u64,
    pub sweep_interval_ms: u64,
    pub tick_interval_ms: u64,
    /// Key used when neither the caller nor the device supplies one.
    pub default_secret_key: String,
    /// Devices registered as active at startup.
    pub known_devices: Vec<String>,
    /// Send one discovery broadcast once the loop starts.
    pub discover_on_start: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 1000,
            max_attempts: 3,
            stale_pending_ms: 15_000,
            sweep_interval_ms: 5_000,
            tick_interval_ms: 10,
            default_secret_key: DEFAULT_SECRET_KEY.to_string(),
            known_devices: Vec::new(),
            discover_on_start: true,
        }
    }
}

impl GatewayConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn stale_pending(&self) -> Duration {
        Duration::from_millis(self.stale_pending_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Metrics buffered while the uplink is down; oldest are dropped first.
    pub metric_queue_capacity: usize,
    pub flush_interval_ms: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            metric_queue_capacity: 100,
            flush_interval_ms: 10,
        }
    }
}

impl UplinkConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("zbgateway.log".to_string()),
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Write a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let g = &self.gateway;
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("serial.baud_rate must be greater than zero"));
        }
        if g.reply_timeout_ms == 0 {
            return Err(anyhow!("gateway.reply_timeout_ms must be greater than zero"));
        }
        if g.max_attempts == 0 {
            return Err(anyhow!("gateway.max_attempts must be at least 1"));
        }
        if g.stale_pending_ms == 0 || g.sweep_interval_ms == 0 || g.tick_interval_ms == 0 {
            return Err(anyhow!(
                "gateway stale/sweep/tick intervals must be greater than zero"
            ));
        }
        validate_secret_key(&g.default_secret_key)
            .map_err(|e| anyhow!("gateway.default_secret_key: {}", e))?;
        for id in &g.known_devices {
            validate_device_id(id).map_err(|e| anyhow!("gateway.known_devices '{}': {}", id, e))?;
        }
        if self.uplink.metric_queue_capacity == 0 {
            return Err(anyhow!("uplink.metric_queue_capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_timing() {
        let g = GatewayConfig::default();
        assert_eq!(g.reply_timeout(), Duration::from_millis(1000));
        assert_eq!(g.max_attempts, 3);
        assert_eq!(g.stale_pending(), Duration::from_secs(15));
        assert_eq!(g.sweep_interval(), Duration::from_secs(5));
        assert_eq!(g.default_secret_key, "123");
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyACM0"

            [gateway]
            max_attempts = 5
            known_devices = ["D1", "D2"]
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.gateway.max_attempts, 5);
        assert_eq!(config.gateway.reply_timeout_ms, 1000);
        assert_eq!(config.gateway.known_devices, vec!["D1", "D2"]);
        assert_eq!(config.uplink, UplinkConfig::default());
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let mut config = Config::default();
        config.gateway.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.default_secret_key = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gateway.known_devices = vec!["bad,id".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.uplink.metric_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn serializes_back_to_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        assert!(text.contains("[gateway]"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
