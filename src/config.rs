//! WolfBridge Configuration
//!
//! Process-level settings for the bridge. Server-side VPN settings
//! (endpoint, subnets, DNS) live in the store, not here; this file only
//! decides how the bridge talks to its store and to the device library.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::{parse_level, LogLevel};

/// Environment variable consulted when no config was loaded explicitly
pub const CONFIG_ENV: &str = "WOLFBRIDGE_CONFIG";

/// Defaults applied to server configuration and new records
pub mod defaults {
    pub const NETWORK: &str = "10.8.0.0/24";
    pub const DNS_PRIMARY: &str = "1.1.1.1";
    pub const MTU: u32 = 1420;
    pub const KEEPALIVE: u32 = 25;
    pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0";
    pub const CLIENT_ALLOWED_IPS_DUAL: &str = "0.0.0.0/0, ::/0";
    pub const MULTIHOP_ALLOWED_IPS: &str = "0.0.0.0/0";
    pub const MULTIHOP_ROUTING_TABLE: &str = "wolfbridge_multihop";
    pub const MULTIHOP_ROUTING_TABLE_ID: u32 = 100;
    pub const MULTIHOP_PRIORITY: u32 = 100;
}

/// Main WolfBridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Device library settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Stats syncer settings
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// How long a call waits on a lock held by another writer
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Which device implementation backs tunnel devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// External userspace implementation driven over its UAPI socket
    Userspace,
    /// In-process device model (no kernel interface)
    Memory,
}

/// Device library configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backend used for primary and multihop devices
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Userspace implementation started per interface
    #[serde(default = "default_userspace_command")]
    pub userspace_command: String,

    /// Directory holding `<ifname>.sock` UAPI sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// How long to wait for a freshly spawned device's socket
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// MTU for devices that have no server configuration (multihop)
    #[serde(default = "default_mtu")]
    pub default_mtu: u32,
}

/// Stats syncer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Interval used when the host passes a non-positive interval
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (silent, error, verbose)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format for the ctl binary (full, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_backend() -> BackendKind {
    BackendKind::Userspace
}

fn default_userspace_command() -> String {
    "wireguard-go".to_string()
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/wireguard")
}

fn default_startup_timeout_ms() -> u64 {
    5000
}

fn default_mtu() -> u32 {
    defaults::MTU
}

fn default_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "error".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            userspace_command: default_userspace_command(),
            socket_dir: default_socket_dir(),
            startup_timeout_ms: default_startup_timeout_ms(),
            default_mtu: default_mtu(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `WOLFBRIDGE_CONFIG` if set, defaults otherwise
    pub fn from_env() -> crate::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.device.backend == BackendKind::Userspace
            && self.device.userspace_command.trim().is_empty()
        {
            return Err(crate::Error::Config(
                "device.userspace_command cannot be empty".into(),
            ));
        }

        if !(576..=65535).contains(&self.device.default_mtu) {
            return Err(crate::Error::Config(format!(
                "device.default_mtu out of range: {}",
                self.device.default_mtu
            )));
        }

        if self.stats.interval_secs == 0 {
            return Err(crate::Error::Config("stats.interval_secs must be positive".into()));
        }

        if parse_level(&self.logging.level).is_none() {
            return Err(crate::Error::Config(format!(
                "unknown logging.level: {}",
                self.logging.level
            )));
        }

        if !matches!(self.logging.format.as_str(), "full" | "compact") {
            return Err(crate::Error::Config(format!(
                "unknown logging.format: {}",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get store busy timeout as Duration
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store.busy_timeout_ms)
    }

    /// Get the default stats interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats.interval_secs)
    }

    /// Bridge log level: a non-negative host value wins, otherwise `[logging] level`
    pub fn log_level(&self, host_level: i32) -> LogLevel {
        if host_level >= 0 {
            return LogLevel::from_i32(host_level);
        }
        parse_level(&self.logging.level).unwrap_or(LogLevel::Error)
    }
}

impl DeviceConfig {
    /// UAPI socket path for an interface
    pub fn socket_path(&self, ifname: &str) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", ifname))
    }

    /// Get device startup timeout as Duration
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[store]
busy_timeout_ms = 2500

[device]
backend = "memory"
default_mtu = 1380

[stats]
interval_secs = 5

[logging]
level = "verbose"
"#;

        let config = BridgeConfig::from_str(toml).unwrap();
        assert_eq!(config.device.backend, BackendKind::Memory);
        assert_eq!(config.device.default_mtu, 1380);
        assert_eq!(config.busy_timeout(), Duration::from_millis(2500));
        assert_eq!(config.stats_interval(), Duration::from_secs(5));
        assert_eq!(config.device.userspace_command, "wireguard-go");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BridgeConfig::from_str("").unwrap();
        assert_eq!(config.device.backend, BackendKind::Userspace);
        assert_eq!(config.store.busy_timeout_ms, 5000);
        assert_eq!(
            config.device.socket_path("wg0"),
            PathBuf::from("/var/run/wireguard/wg0.sock")
        );
        assert_eq!(config.logging.format, "full");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(BridgeConfig::from_str("[stats]\ninterval_secs = 0\n").is_err());
        assert!(BridgeConfig::from_str("[logging]\nlevel = \"loud\"\n").is_err());
        assert!(BridgeConfig::from_str("[device]\ndefault_mtu = 100\n").is_err());
        assert!(BridgeConfig::from_str("[logging]\nformat = \"json\"\n").is_err());
    }

    #[test]
    fn test_log_level_fallback() {
        let config = BridgeConfig::from_str("[logging]\nlevel = \"verbose\"\n").unwrap();
        assert_eq!(config.log_level(-1), LogLevel::Verbose);
        assert_eq!(config.log_level(0), LogLevel::Silent);
        assert_eq!(config.log_level(1), LogLevel::Error);
        assert_eq!(BridgeConfig::default().log_level(-1), LogLevel::Error);
    }
}
