//! Configuration handling
//!
//! Reads `journal-sync.toml` from the data directory. A missing file means
//! defaults.
//!
//! ## Environment Variables
//!
//! The following environment variables override config file settings:
//!
//! - `JOURNAL_SYNC_SERVER_URL` - Base URL of the sync server
//! - `JOURNAL_SYNC_TOKEN` - Bearer token sent with every request
//! - `JOURNAL_SYNC_INTERVAL_SECS` - Periodic sync interval
//! - `JOURNAL_SYNC_DEBOUNCE_MS` - Debounce window after local edits
//! - `JOURNAL_SYNC_MAX_ATTEMPTS` - Attempts before a queue item is parked
//!
//! These can be set in a `.env` file in the data directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::queue::DEFAULT_MAX_ATTEMPTS;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "journal-sync.toml";

/// Application directory name under the platform data dir
pub const APP_DIR_NAME: &str = "journal-sync";

/// Environment variable names
pub const ENV_SERVER_URL: &str = "JOURNAL_SYNC_SERVER_URL";
pub const ENV_TOKEN: &str = "JOURNAL_SYNC_TOKEN";
pub const ENV_INTERVAL_SECS: &str = "JOURNAL_SYNC_INTERVAL_SECS";
pub const ENV_DEBOUNCE_MS: &str = "JOURNAL_SYNC_DEBOUNCE_MS";
pub const ENV_MAX_ATTEMPTS: &str = "JOURNAL_SYNC_MAX_ATTEMPTS";

/// Runtime settings of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Periodic full sync while foregrounded
    pub interval: Duration,
    /// Quiet period after the last local edit before pushing
    pub debounce: Duration,
    /// Per-request transport timeout
    pub request_timeout: Duration,
    pub max_attempts: u32,
    /// Health probe cadence when connectivity comes from polling
    pub probe_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            debounce: Duration::from_millis(2000),
            request_timeout: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            probe_interval: Duration::from_secs(15),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Sync server base URL
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Optional bearer token
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub sync: SyncSection,
}

fn default_server_url() -> String {
    "http://localhost:8080/api".to_string()
}

/// `[sync]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_probe_interval_secs() -> u64 {
    15
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            debounce_ms: default_debounce_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: String::new(),
            sync: SyncSection::default(),
        }
    }
}

impl Config {
    /// Load configuration from a directory
    ///
    /// This also loads any `.env` file in the directory and applies
    /// environment variable overrides.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let mut config = Self::load_file(dir)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse the config file alone, defaults when absent
    pub fn load_file(dir: &Path) -> anyhow::Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", config_path.display(), e))?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.is_empty()) {
            self.server_url = url;
        }

        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.token = token;
        }

        // Unparseable numbers keep the file value
        if let Some(secs) = lookup(ENV_INTERVAL_SECS).and_then(|v| v.parse().ok()) {
            self.sync.interval_secs = secs;
        }

        if let Some(ms) = lookup(ENV_DEBOUNCE_MS).and_then(|v| v.parse().ok()) {
            self.sync.debounce_ms = ms;
        }

        if let Some(attempts) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| v.parse().ok()) {
            self.sync.max_attempts = attempts;
        }
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Write a default config file unless one exists. Returns whether a
    /// file was written.
    pub fn init(dir: &Path) -> anyhow::Result<bool> {
        if dir.join(CONFIG_FILE_NAME).exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(dir)?;
        Self::default().save(dir)?;
        Ok(true)
    }

    pub fn token(&self) -> Option<String> {
        if self.token.is_empty() {
            None
        } else {
            Some(self.token.clone())
        }
    }

    /// Runtime settings for the orchestrator
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.sync.interval_secs.max(1)),
            debounce: Duration::from_millis(self.sync.debounce_ms),
            request_timeout: Duration::from_secs(self.sync.request_timeout_secs.max(1)),
            max_attempts: self.sync.max_attempts.max(1),
            probe_interval: Duration::from_secs(self.sync.probe_interval_secs.max(1)),
        }
    }
}

/// Platform data directory for the engine's files
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
