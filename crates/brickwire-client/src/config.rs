//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/brickwire/config.toml` by default.
//!
//! The authentication secret supports the references understood by
//! [`crate::secret::resolve`] (`pass::path`, `env::VAR` and `file::path`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Default Brick Daemon port.
pub const DEFAULT_PORT: u16 = 4223;

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for a connection to a Brick Daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Where to connect and how long to wait for responses.
    pub connection: ConnectionSettings,

    /// Automatic reconnect behavior.
    pub reconnect: ReconnectPolicy,

    /// Dead peer detection.
    pub keepalive: KeepaliveSettings,
}

/// Connection target and request timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Host name or address of the daemon.
    pub host: String,

    /// TCP port of the daemon.
    pub port: u16,

    /// Response timeout in milliseconds.
    pub timeout_ms: u64,

    /// Authentication secret (supports `pass::`, `env::` and `file::` prefixes).
    pub secret: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            timeout_ms: 2500,
            secret: None,
        }
    }
}

/// When and how often to reconnect after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect automatically after a transport failure.
    pub enabled: bool,

    /// Delay between reconnect attempts in milliseconds.
    pub interval_ms: u64,

    /// Disconnects tolerated inside `window_secs` before giving up.
    pub max_disconnects: usize,

    /// Rolling window for counting disconnects, in seconds.
    pub window_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 100,
            max_disconnects: 3,
            window_secs: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay between attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Rolling window for the disconnect threshold.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Disconnect probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    /// Idle time after which a probe packet is written, in milliseconds.
    /// 0 turns probing off.
    pub disconnect_probe_interval_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            disconnect_probe_interval_ms: 5000,
        }
    }
}

impl KeepaliveSettings {
    /// Probe interval, or `None` when probing is off.
    pub fn interval(&self) -> Option<Duration> {
        (self.disconnect_probe_interval_ms > 0)
            .then(|| Duration::from_millis(self.disconnect_probe_interval_ms))
    }
}

impl ClientConfig {
    /// Creates a configuration for the given daemon address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            connection: ConnectionSettings {
                host: host.into(),
                port,
                ..ConnectionSettings::default()
            },
            ..Self::default()
        }
    }

    /// Sets the response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connection.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the authentication secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.connection.secret = Some(secret.into());
        self
    }

    /// Enables or disables automatic reconnect.
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    /// Replaces the reconnect policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the disconnect probe interval.
    #[must_use]
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.keepalive.disconnect_probe_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Response timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.connection.timeout_ms)
    }

    /// Resolves the configured secret, expanding `pass::`, `env::` and `file::`
    /// references.
    pub fn resolve_secret(&self) -> ClientResult<Option<String>> {
        self.connection
            .secret
            .as_deref()
            .map(crate::secret::resolve)
            .transpose()
    }

    /// Loads configuration from the default path.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {e}")))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brickwire")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_daemon() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 4223);
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_disconnects, 3);
        assert_eq!(config.keepalive.interval(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn builder_methods() {
        let config = ClientConfig::new("10.0.0.5", 4280)
            .with_timeout(Duration::from_millis(300))
            .with_secret("hunter2")
            .with_auto_reconnect(false);

        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.connection.port, 4280);
        assert_eq!(config.connection.timeout_ms, 300);
        assert_eq!(config.connection.secret.as_deref(), Some("hunter2"));
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
[connection]
host = "brick.local"

[reconnect]
max_disconnects = 5
"#,
        )
        .unwrap();

        assert_eq!(config.connection.host, "brick.local");
        assert_eq!(config.connection.port, 4223);
        assert_eq!(config.reconnect.max_disconnects, 5);
        assert_eq!(config.reconnect.interval_ms, 100);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection]\nport = 4300\ntimeout_ms = 50\n").unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert_eq!(config.connection.port, 4300);
        assert_eq!(config.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn load_from_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[connection\n").unwrap();

        let result = ClientConfig::load_from(&path);
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn secret_env_reference_resolves() {
        unsafe {
            std::env::set_var("_BRICKWIRE_TEST_CONFIG_SECRET", "from-env");
        }

        let config = ClientConfig::default().with_secret("env::_BRICKWIRE_TEST_CONFIG_SECRET");
        assert_eq!(config.resolve_secret().unwrap().as_deref(), Some("from-env"));

        unsafe {
            std::env::remove_var("_BRICKWIRE_TEST_CONFIG_SECRET");
        }
    }

    #[test]
    fn no_secret_resolves_to_none() {
        assert_eq!(ClientConfig::default().resolve_secret().unwrap(), None);
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = ClientConfig::new("brick.local", 4223);
        let text = toml::to_string(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
