//! Configuration system for Tandem
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.tandem.tandem/config.toml
//! - Linux: ~/.config/tandem/config.toml
//! - Windows: %APPDATA%/tandem/tandem/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::IceServer;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and routing settings
    pub server: ServerConfig,
    /// Matchmaking queue settings
    pub matchmaking: MatchmakingConfig,
    /// Signaling relay settings
    pub relay: RelayConfig,
    /// ICE servers advertised to clients
    pub ice: IceConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Path served by the matchmaking endpoint
    pub matchmaking_path: String,
    /// Path served by the signaling endpoint
    pub signaling_path: String,
    /// How long a new connection may take to send its first message
    pub first_message_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: crate::DEFAULT_PORT,
            matchmaking_path: "/matchmaking".into(),
            signaling_path: "/signaling".into(),
            first_message_timeout_secs: 10,
        }
    }
}

/// Matchmaking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// Maximum number of endpoints waiting for a partner
    pub queue_capacity: usize,
    /// How long a matched connection stays open waiting for the client to close
    pub match_linger_secs: u64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            match_linger_secs: 30,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on a single forward (or MATCH delivery) in milliseconds
    pub send_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5000,
        }
    }
}

/// Static ICE server list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
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

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tandem", "tandem")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        Self::default().to_toml().unwrap_or_default()
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.send_timeout_ms)
    }

    pub fn first_message_timeout(&self) -> Duration {
        Duration::from_secs(self.server.first_message_timeout_secs)
    }

    pub fn match_linger(&self) -> Duration {
        Duration::from_secs(self.matchmaking.match_linger_secs)
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
