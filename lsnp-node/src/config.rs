//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use lsnp_core::{CoreConfig, LSNP_PORT};
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/lsnp/config.toml or /etc/lsnp/config.toml.
/// Env overrides: LSNP_PORT, LSNP_USERNAME, LSNP_BROADCAST, LSNP_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP port, bound on all interfaces (default 50999).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username part of the identity. Falls back to $USER.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    /// Broadcast address for PROFILE/PING/REVOKE (default 255.255.255.255).
    #[serde(default = "default_broadcast")]
    pub broadcast: Ipv4Addr,
    /// Core tick period in milliseconds; retry intervals are counted in ticks.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Pause between two FILE_CHUNK sends.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default)]
    pub protocol: CoreConfig,
}

fn default_port() -> u16 {
    LSNP_PORT
}
fn default_status() -> String {
    "Online".to_string()
}
fn default_broadcast() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_tick_ms() -> u64 {
    500
}
fn default_keepalive_secs() -> u64 {
    300
}
fn default_chunk_delay_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            username: None,
            display_name: None,
            status: default_status(),
            broadcast: default_broadcast(),
            tick_ms: default_tick_ms(),
            keepalive_secs: default_keepalive_secs(),
            chunk_delay_ms: default_chunk_delay_ms(),
            protocol: CoreConfig::default(),
        }
    }
}

impl Config {
    /// Username to announce: configured, else $USER, else "user".
    pub fn username(&self) -> String {
        self.username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "user".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("invalid config {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
}

/// Load config: default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file(&config_paths())?.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lsnp/config.toml"));
    }
    out.push(PathBuf::from("/etc/lsnp/config.toml"));
    out
}

/// Parse the first existing file in `paths`. A file that exists but is broken is an error.
fn load_file(paths: &[PathBuf]) -> Result<Option<Config>, ConfigError> {
    let Some(path) = paths.iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    parse_file(path).map(Some)
}

fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LSNP_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "ignoring invalid LSNP_PORT"),
        }
    }
    if let Some(s) = var("LSNP_USERNAME") {
        c.username = Some(s);
    }
    if let Some(s) = var("LSNP_BROADCAST") {
        match s.parse::<Ipv4Addr>() {
            Ok(a) => c.broadcast = a,
            Err(_) => warn!(value = %s, "ignoring invalid LSNP_BROADCAST"),
        }
    }
    if let Some(s) = var("LSNP_DOWNLOAD_DIR") {
        c.protocol.download_dir = PathBuf::from(s);
    }
}
