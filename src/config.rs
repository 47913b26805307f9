//! Process-wide configuration, read once at startup.
//!
//! Settings come from a TOML file (default `macrorelay.toml` next to the
//! binary) with `MACRORELAY_*` environment variables taking priority for
//! deployment overrides. Every section has working defaults so an empty or
//! missing file still yields a runnable local configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub trigger: TriggerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("macrorelay.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether session lookups go through the in-process read-through cache.
    pub enabled: bool,
    /// How long a cached session entry stays valid (seconds).
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Base URL of the external trigger service.
    pub base_url: String,
    /// Outbound request timeout (seconds).
    pub timeout_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://trigger.macrodroid.com".into(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from the given TOML file, falling back to defaults
    /// when the file does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables beat the config file. Priority matches the
    /// deployment convention: env > file > default.
    fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env("MACRORELAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = non_empty_env("MACRORELAY_PORT").and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(db) = non_empty_env("MACRORELAY_DB_PATH") {
            self.database.path = PathBuf::from(db);
        }
        if let Some(url) = non_empty_env("MACRORELAY_TRIGGER_URL") {
            self.trigger.base_url = url;
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
