/// Configuration management for the workflow backend emulator
///
/// Handles server configuration, snapshot storage location, and background loop intervals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Snapshot storage configuration
    pub storage: StorageConfig,
    /// Background loop configuration
    pub emulator: EmulatorConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Local key-value snapshot layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding one snapshot row per database name
    pub snapshot_path: String,
    /// Key namespace, snapshots are stored under "{namespace}:{db_name}"
    pub namespace: String,
}

/// Intervals of the socket broker and the wait scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    pub broker_poll_interval_ms: u64,
    pub wait_scheduler_interval_ms: u64,
}

impl EmulatorConfig {
    pub fn broker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.broker_poll_interval_ms)
    }

    pub fn wait_scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.wait_scheduler_interval_ms)
    }
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            broker_poll_interval_ms: env_or("WKF_EMULATOR_BROKER_POLL_MS", 200),
            wait_scheduler_interval_ms: env_or("WKF_EMULATOR_WAIT_TICK_MS", 1000),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("WKF_EMULATOR_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("WKF_EMULATOR_PORT", 3001),
            },
            storage: StorageConfig {
                snapshot_path: std::env::var("WKF_EMULATOR_SNAPSHOT_PATH")
                    .unwrap_or_else(|_| "data/emulator.db".to_string()),
                namespace: std::env::var("WKF_EMULATOR_NAMESPACE")
                    .unwrap_or_else(|_| "wkf_emulator".to_string()),
            },
            emulator: EmulatorConfig::default(),
        }
    }
}

/// Parse a numeric environment variable, falling back on absence or parse failure
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
