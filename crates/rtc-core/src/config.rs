//! Configuration system
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/rtc-embed/config.toml
//! - Linux: ~/.config/rtc-embed/config.toml
//! - Windows: %APPDATA%/rtc-embed/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_RELEASE_VERSION};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signal server settings
    pub signal: SignalConfig,
    /// Token issuer settings
    pub auth: AuthConfig,
    /// Client coordinator settings
    pub client: ClientConfig,
    /// Coordinator code loader settings
    pub loader: LoaderConfig,
}

/// Signal server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Session journal path (None = no journal)
    pub db_path: Option<PathBuf>,
    /// Sessions without signaling activity for this long are finalized
    pub idle_timeout_secs: u64,
    /// How often the sweeper runs
    pub sweep_interval_secs: u64,
    /// A connection must authenticate within this window
    pub auth_timeout_secs: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            db_path: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            sweep_interval_secs: 10,
            auth_timeout_secs: 10,
        }
    }
}

impl SignalConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Token issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for the keyed-MAC token issuer (None = random per process)
    pub token_secret: Option<String>,
    /// Lifetime of issued tokens in seconds
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: 3600, // 1 hour
        }
    }
}

/// Client coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Signal server WebSocket URL
    pub signal_url: String,
    /// Timeout for opening the signaling channel (seconds)
    pub connect_timeout_secs: u64,
    /// Timeout for the authentication round trip (seconds)
    pub auth_timeout_secs: u64,
    /// Heartbeat interval while joined (seconds)
    pub heartbeat_interval_secs: u64,
    /// How long teardown waits for the best-effort hangup (milliseconds)
    pub hangup_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: format!("ws://127.0.0.1:{}", DEFAULT_PORT),
            connect_timeout_secs: 10,
            auth_timeout_secs: 10,
            heartbeat_interval_secs: 15,
            hangup_grace_ms: 500,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn hangup_grace(&self) -> Duration {
        Duration::from_millis(self.hangup_grace_ms)
    }
}

/// Coordinator code loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Origin serving `/embed/webrtc-embed-<version>.js`
    pub base_url: String,
    /// Release version of the coordinator code
    pub release_version: String,
    /// Hex BLAKE3 digest; when set, the loader pins content instead of cache-busting
    pub pinned_digest: Option<String>,
    /// Origin used to absolutize relative avatar paths
    pub asset_origin: Option<String>,
    /// Fetch timeout in seconds
    pub fetch_timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://webrtc.example.com".into(),
            release_version: DEFAULT_RELEASE_VERSION.into(),
            pinned_digest: None,
            asset_origin: None,
            fetch_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "rtc-embed", "rtc-embed")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signal.port, DEFAULT_PORT);
        assert_eq!(config.signal.idle_timeout(), Duration::from_secs(60));
        assert!(config.loader.pinned_digest.is_none());
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [signal]
            idle_timeout_secs = 5

            [loader]
            release_version = "20250901-001"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.signal.idle_timeout_secs, 5);
        assert_eq!(config.loader.release_version, "20250901-001");
        // Other values should be defaults
        assert_eq!(config.signal.port, DEFAULT_PORT);
        assert_eq!(config.client.heartbeat_interval_secs, 15);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[signal]"));
        assert!(sample.contains("[client]"));
        assert!(sample.contains("[loader]"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.auth.token_secret = Some("s3cret".into());
        config.signal.sweep_interval_secs = 3;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.auth.token_secret.as_deref(), Some("s3cret"));
        assert_eq!(loaded.signal.sweep_interval_secs, 3);
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.signal.port, DEFAULT_PORT);
    }

    #[test]
    fn test_config_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[signal\nport = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
