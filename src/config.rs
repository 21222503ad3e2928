//! Persistence for user preferences.
//!
//! `config.json` lives in the platform config directory
//! (`~/.config/readmark/` on Linux, `~/Library/Application Support/readmark/`
//! on macOS). The gateway URL can be overridden with `READMARK_GATEWAY_URL`.

use crate::transport::link::normalize_url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment override for [`Config::gateway_url`]
pub const GATEWAY_URL_ENV: &str = "READMARK_GATEWAY_URL";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// User preferences (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Push transport endpoint: `host:port`, `tcp://host:port` or `unix:/path`
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Trailing debounce for position pushes
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Remote marker transition length
    #[serde(default = "default_animation_ms")]
    pub animation_ms: u64,
}

fn default_gateway_url() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_snapshot_timeout_ms() -> u64 {
    5000
}

fn default_animation_ms() -> u64 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            debounce_ms: default_debounce_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            animation_ms: default_animation_ms(),
        }
    }
}

impl Config {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn animation(&self) -> Duration {
        Duration::from_millis(self.animation_ms)
    }

    /// Apply an environment override of the gateway URL, if set and non-empty.
    pub fn with_gateway_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.map(|u| normalize_url(&u)).filter(|u| !u.is_empty()) {
            debug!(%url, "gateway url overridden");
            self.gateway_url = url;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("readmark"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from disk, returning defaults if the file is missing or invalid.
/// `READMARK_GATEWAY_URL` takes precedence over the stored URL.
pub fn load_config() -> Config {
    let config = match config_dir().map(|d| d.join("config.json")) {
        Some(path) => load_config_from(&path),
        None => Config::default(),
    };
    config.with_gateway_override(std::env::var(GATEWAY_URL_ENV).ok())
}

/// Save config to disk.
pub fn save_config(config: &Config) -> Result<(), std::io::Error> {
    let dir = config_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &dir.join("config.json"))
}

/// Persist a new gateway URL, keeping the other stored settings.
pub fn save_gateway_url(url: &str) -> Result<Config, std::io::Error> {
    let dir = config_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    let path = dir.join("config.json");
    let mut config = load_config_from(&path);
    config.gateway_url = normalize_url(url);
    save_config_to(&config, &path)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Path-parameterised helpers (used by public API and tests)
// ---------------------------------------------------------------------------

fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => Config::default(),
    }
}

fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Write to a temp file in the same directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
