//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.carlink/config.json`) and environment.
//! Every field has a default, so a missing file or an empty `{}` is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Relay listener settings (HTTP + WebSocket on one port).
    #[serde(default)]
    pub relay: RelayConfig,

    /// Outbound device connection settings.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Per-session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

/// Relay bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 8081). Overridden by CARLINK_PORT env.
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,
}

/// Device connection timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Upper bound on a single TCP connect attempt.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between an unsolicited disconnect and the reconnect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Size of the read buffer; one device data event carries at most this many bytes.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Interval between transport-level WebSocket pings; 0 turns them off.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

fn default_relay_port() -> u16 {
    8081
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_read_buffer_size() -> usize {
    1024
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SessionConfig {
    /// `None` when keepalive pings are disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Resolve the relay port: env CARLINK_PORT overrides config. Unparseable values are ignored.
pub fn resolve_relay_port(config: &Config) -> u16 {
    std::env::var("CARLINK_PORT")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(config.relay.port)
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CARLINK_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".carlink").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or CARLINK_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_relay_contract() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8081);
        assert_eq!(config.relay.bind, "127.0.0.1");
        assert_eq!(config.device.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.device.connect_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.session.keepalive_interval(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn empty_object_parses_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.relay.port, 8081);
        assert_eq!(config.device.read_buffer_size, 1024);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"device":{"reconnectDelayMs":250},"relay":{"port":9000}}"#)
                .unwrap();
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.bind, "127.0.0.1");
        assert_eq!(config.device.reconnect_delay_ms, 250);
        assert_eq!(config.device.connect_timeout_ms, 5_000);
    }

    #[test]
    fn zero_keepalive_disables_pings() {
        let config: Config =
            serde_json::from_str(r#"{"session":{"keepaliveIntervalMs":0}}"#).unwrap();
        assert_eq!(config.session.keepalive_interval(), None);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("carlink-config-test-does-not-exist.json");
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.relay.port, 8081);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }
}
