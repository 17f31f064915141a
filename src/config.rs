//! Server configuration
//!
//! Loaded from a TOML file, e.g.
//!
//! ```toml
//! listen = "0.0.0.0:6750"
//! chunk = 0x5100
//!
//! [[permit]]
//! driver = "sqlite"
//! dbname = "/srv/data/*.db"
//! user = "*"
//! ```
//!
//! ## Environment Variables
//!
//! - `SQLIPC_LISTEN` - Listen address
//! - `SQLIPC_CHUNK` - First message code, decimal or `0x` hex
//!
//! These can be set in a `.env` file next to the config file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::driver::protocol::DEFAULT_CHUNK;
use crate::error::{DbError, DbResult};

/// Environment variable names
pub const ENV_LISTEN: &str = "SQLIPC_LISTEN";
pub const ENV_CHUNK: &str = "SQLIPC_CHUNK";

pub const DEFAULT_LISTEN: &str = "127.0.0.1:6750";

/// One allow-list entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermitConfig {
    pub driver: String,
    pub dbname: String,
    #[serde(default = "any")]
    pub user: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: u16,
}

fn any() -> String {
    "*".to_string()
}

impl FromStr for PermitConfig {
    type Err = String;

    /// Parse `driver:dbname[:user]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(driver), Some(dbname), user) if !driver.is_empty() && !dbname.is_empty() => {
                Ok(PermitConfig {
                    driver: driver.to_string(),
                    dbname: dbname.to_string(),
                    user: user.filter(|u| !u.is_empty()).map_or_else(any, str::to_string),
                    host: None,
                    port: 0,
                })
            }
            _ => Err(format!("Expected 'driver:dbname[:user]', got '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// First message code; clients must use the same value
    #[serde(default = "default_chunk")]
    pub chunk: u32,
    #[serde(default, rename = "permit")]
    pub permits: Vec<PermitConfig>,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_chunk() -> u32 {
    DEFAULT_CHUNK
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            chunk: default_chunk(),
            permits: Vec::new(),
        }
    }
}

/// Parse a chunk base given in decimal or `0x` hex
pub fn parse_chunk(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("Invalid chunk '{}': {}", s, e))
}

impl ServerConfig {
    /// Load configuration from a file
    ///
    /// A `.env` file in the same directory is loaded first, then
    /// environment overrides are applied.
    pub fn load(path: &Path) -> DbResult<Self> {
        if let Some(dir) = path.parent() {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            }
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DbError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, reading `.env` from the
    /// working directory if present
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn parse(content: &str) -> DbResult<Self> {
        let config: ServerConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup(ENV_LISTEN) {
            if !listen.is_empty() {
                self.listen = listen;
            }
        }

        if let Some(chunk) = lookup(ENV_CHUNK) {
            match parse_chunk(&chunk) {
                Ok(chunk) => self.chunk = chunk,
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_CHUNK, e),
            }
        }
    }
}
