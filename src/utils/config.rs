//! Configuration management for the chat node.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "p2pchat.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "P2PCHAT";

/// Smallest frame limit that still fits a handshake envelope
pub const MIN_FRAME_SIZE: usize = 1024;

/// Complete configuration for a chat node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Local identity and listener
    pub node: NodeConfig,
    /// Remote directory service
    pub directory: DirectoryConfig,
    /// Peer transport tuning
    pub network: NetworkConfig,
    /// On-disk locations
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local node identity and listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique handle registered with the directory
    pub username: String,
    /// Interface to bind the peer listener on
    pub listen_host: String,
    /// Port for inbound peer connections
    pub listen_port: u16,
    /// Address other peers should dial (defaults to the bound address)
    pub advertise_address: Option<String>,
}

/// Directory service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the PostgREST endpoint
    pub base_url: String,
    /// API key sent with each request
    pub api_key: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Interval between heartbeats in seconds
    pub heartbeat_interval_secs: u64,
    /// Interval between offline queue polls in seconds
    pub offline_poll_interval_secs: u64,
    /// How long a resolved friend record stays fresh, in seconds
    pub friend_ttl_secs: u64,
}

/// Peer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Outbound TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Time allowed for the handshake to complete, in seconds
    pub handshake_timeout_secs: u64,
    /// Sessions with no traffic for this long are closed, in seconds
    pub idle_timeout_secs: u64,
    /// A frame write that stalls this long closes the session, in seconds
    pub write_timeout_secs: u64,
    /// Largest accepted frame body in bytes
    pub max_frame_size: usize,
    /// Maximum number of concurrent peer sessions
    pub max_sessions: usize,
    /// Accepted clock skew for envelope timestamps, in seconds
    pub max_clock_skew_secs: u64,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Key file holding the node identity
    pub key_file: PathBuf,
    /// Directory for per-peer chat history
    pub history_dir: PathBuf,
    /// Persisted friend list
    pub friends_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: crate::defaults::DEFAULT_PORT,
            advertise_address: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            request_timeout_secs: 10,
            heartbeat_interval_secs: crate::defaults::DEFAULT_HEARTBEAT_INTERVAL,
            offline_poll_interval_secs: 60,
            friend_ttl_secs: crate::defaults::DEFAULT_FRIEND_TTL,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: crate::defaults::DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout_secs: 10,
            idle_timeout_secs: crate::defaults::DEFAULT_IDLE_TIMEOUT,
            write_timeout_secs: crate::defaults::DEFAULT_WRITE_TIMEOUT,
            max_frame_size: crate::MAX_FRAME_SIZE,
            max_sessions: crate::defaults::DEFAULT_MAX_SESSIONS,
            max_clock_skew_secs: 300,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2pchat");
        Self::under(data_dir)
    }
}

impl StorageConfig {
    /// Lay out every storage path under a single base directory
    pub fn under<P: Into<PathBuf>>(data_dir: P) -> Self {
        let data_dir = data_dir.into();
        Self {
            key_file: data_dir.join("keys").join("identity.json"),
            history_dir: data_dir.join("history"),
            friends_file: data_dir.join("friends.json"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Idle session timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Per-frame write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Accepted clock skew
    pub fn max_clock_skew(&self) -> Duration {
        Duration::from_secs(self.max_clock_skew_secs)
    }
}

impl DirectoryConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Offline queue poll period
    pub fn offline_poll_interval(&self) -> Duration {
        Duration::from_secs(self.offline_poll_interval_secs)
    }

    /// Friend cache freshness window
    pub fn friend_ttl(&self) -> Duration {
        Duration::from_secs(self.friend_ttl_secs)
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// Validation runs once after all sources are merged, so a file may
    /// leave out values that the environment later supplies.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let config = Self::load_unvalidated(config_file)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge defaults, the first config file found and the environment
    /// without validating the result
    pub fn load_unvalidated(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let candidates = match config_file {
            Some(path) => vec![path.to_path_buf()],
            None => vec![
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("p2pchat")
                    .join(DEFAULT_CONFIG_FILE),
            ],
        };

        for location in &candidates {
            if location.exists() {
                let content =
                    std::fs::read_to_string(location).map_err(|_| ConfigError::FileNotFound {
                        path: location.display().to_string(),
                    })?;
                config = toml::from_str(&content).map_err(ConfigError::from)?;
                break;
            }
        }

        config.merge_from_env()
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(username) = std::env::var(format!("{ENV_PREFIX}_NODE_USERNAME")) {
            self.node.username = username;
        }

        let port_var = format!("{ENV_PREFIX}_NODE_LISTEN_PORT");
        if let Ok(port) = std::env::var(&port_var) {
            self.node.listen_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                field: port_var.clone(),
                value: port,
            })?;
        }

        if let Ok(address) = std::env::var(format!("{ENV_PREFIX}_NODE_ADVERTISE_ADDRESS")) {
            self.node.advertise_address = Some(address);
        }

        if let Ok(url) = std::env::var(format!("{ENV_PREFIX}_DIRECTORY_BASE_URL")) {
            self.directory.base_url = url;
        }

        if let Ok(key) = std::env::var(format!("{ENV_PREFIX}_DIRECTORY_API_KEY")) {
            self.directory.api_key = key;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage = StorageConfig::under(data_dir);
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.node.username.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "node.username".to_string(),
            }
            .into());
        }

        // Port 0 binds an ephemeral port.
        if self.node.listen_host.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "node.listen_host".to_string(),
            }
            .into());
        }

        let timeouts = [
            ("network.connect_timeout_secs", self.network.connect_timeout_secs),
            ("network.handshake_timeout_secs", self.network.handshake_timeout_secs),
            ("network.idle_timeout_secs", self.network.idle_timeout_secs),
            ("network.write_timeout_secs", self.network.write_timeout_secs),
            ("directory.heartbeat_interval_secs", self.directory.heartbeat_interval_secs),
            ("directory.offline_poll_interval_secs", self.directory.offline_poll_interval_secs),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        if self.network.max_frame_size < MIN_FRAME_SIZE {
            return Err(invalid(
                "network.max_frame_size",
                &self.network.max_frame_size.to_string(),
            ));
        }

        if self.network.max_sessions == 0 {
            return Err(invalid("network.max_sessions", "0"));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs_to_create = vec![
            self.storage.data_dir.clone(),
            self.storage.history_dir.clone(),
        ];
        if let Some(parent) = self.storage.key_file.parent() {
            dirs_to_create.push(parent.to_path_buf());
        }

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::ChatError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn named(username: &str) -> ChatConfig {
        let mut config = ChatConfig::default();
        config.node.username = username.to_string();
        config
    }

    #[test]
    fn test_default_config_needs_username() {
        assert!(ChatConfig::default().validate().is_err());

        let config = named("alice");
        assert!(config.validate().is_ok());
        assert_eq!(config.node.listen_port, crate::defaults::DEFAULT_PORT);
        assert_eq!(config.network.max_frame_size, crate::MAX_FRAME_SIZE);
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = named("bob");
        config.node.listen_port = 7001;
        config.directory.base_url = "https://example.supabase.co".to_string();
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = ChatConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.node.username, "bob");
        assert_eq!(loaded.node.listen_port, 7001);
        assert_eq!(loaded.directory.base_url, "https://example.supabase.co");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let toml_src = "[node]\nusername = \"carol\"\nlisten_port = 7100\n";
        let config: ChatConfig = toml::from_str(toml_src).unwrap();

        assert_eq!(config.node.username, "carol");
        assert_eq!(config.node.listen_port, 7100);
        assert_eq!(
            config.network.idle_timeout_secs,
            crate::defaults::DEFAULT_IDLE_TIMEOUT
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = named("alice");
        config.node.listen_host = String::new();
        assert!(config.validate().is_err());

        let mut config = named("alice");
        config.node.listen_port = 0;
        assert!(config.validate().is_ok());

        let mut config = named("alice");
        config.network.idle_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = named("alice");
        config.network.write_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = named("alice");
        config.network.max_frame_size = 16;
        assert!(config.validate().is_err());

        let mut config = named("alice");
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("P2PCHAT_NODE_LISTEN_PORT", "9999");

        let config = named("alice").merge_from_env().unwrap();
        assert_eq!(config.node.listen_port, 9999);

        std::env::remove_var("P2PCHAT_NODE_LISTEN_PORT");
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig::under("/tmp/p2pchat-test");

        assert!(storage.key_file.starts_with(&storage.data_dir));
        assert!(storage.history_dir.starts_with(&storage.data_dir));
        assert!(storage.friends_file.starts_with(&storage.data_dir));
    }
}
