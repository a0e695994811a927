//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::crypto::Cipher;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
///
/// Immutable once the server is built; the dispatcher only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, or a bare port number
    pub listen: String,
    /// Shared secret the cipher is derived from
    pub password: String,
    /// Throttling rate in bytes per second (0 = unlimited)
    #[serde(default)]
    pub throttling: u64,
    /// Throttling burst ceiling in bytes
    #[serde(default)]
    pub throttling_max: u64,
    /// Refuse UDP relay requests
    #[serde(default)]
    pub disable_udp: bool,
    /// Disguise target: an `http(s)://` URL to reverse proxy, or a directory
    #[serde(default)]
    pub proxy_pass: Option<String>,
    /// Registered users, keyed by the auth token clients send
    #[serde(default)]
    pub users: HashMap<String, UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8100".to_string(),
            password: "0123456789abcdef".to_string(),
            throttling: 0,
            throttling_max: 0,
            disable_udp: false,
            proxy_pass: None,
            users: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Build the cipher context shared by the dispatcher and the bridges
    pub fn cipher(&self) -> Cipher {
        Cipher::new(&self.password)
    }

    /// Resolve `listen` into a bind address, expanding a bare port
    pub fn bind_addr(&self) -> String {
        resolve_bind_addr(&self.listen)
    }
}

/// Per-user settings
///
/// Only the presence of a user in [`ServerConfig::users`] is consulted. The
/// throttling overrides are carried for multi-user mode and ignored today.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Auth token
    pub auth: String,
    /// Per-user throttling rate (unused)
    #[serde(default)]
    pub throttling: u64,
    /// Per-user throttling burst (unused)
    #[serde(default)]
    pub throttling_max: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Expand a bare port number into `0.0.0.0:<port>`; other strings pass through
pub fn resolve_bind_addr(addr: &str) -> String {
    match addr.parse::<u16>() {
        Ok(port) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).to_string(),
        Err(_) => addr.to_string(),
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut server = ServerConfig {
        proxy_pass: Some("http://127.0.0.1:8080".to_string()),
        ..Default::default()
    };
    server.users.insert(
        "alice".to_string(),
        UserConfig {
            auth: "alice".to_string(),
            ..Default::default()
        },
    );

    Config {
        server,
        logging: LoggingConfig::default(),
    }
}
