//! Protocol tunables. Embedded as the `[protocol]` table of the daemon config.

use std::path::PathBuf;

use serde::Deserialize;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::delivery::{DEFAULT_DEDUP_CAPACITY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL_TICKS};

/// Default lifetime of issued tokens, in seconds.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Ticks between retransmissions of an unacknowledged message.
    #[serde(default = "default_retry_interval_ticks")]
    pub retry_interval_ticks: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Bytes per file chunk before base64 encoding.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Where completed inbound files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Evict peers not heard from within this many ticks. Unset keeps peers forever.
    #[serde(default)]
    pub peer_timeout_ticks: Option<u64>,
}

fn default_retry_interval_ticks() -> u64 {
    DEFAULT_RETRY_INTERVAL_TICKS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry_interval_ticks: default_retry_interval_ticks(),
            max_retries: default_max_retries(),
            dedup_capacity: default_dedup_capacity(),
            chunk_size: default_chunk_size(),
            token_ttl_secs: default_token_ttl_secs(),
            download_dir: default_download_dir(),
            peer_timeout_ticks: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_gives_defaults() {
        let cfg: CoreConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, CoreConfig::default());
        assert_eq!(cfg.retry_interval_ticks, 4);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.peer_timeout_ticks, None);
    }

    #[test]
    fn partial_override() {
        let cfg: CoreConfig = toml::from_str(
            r#"
            max_retries = 5
            chunk_size = 4096
            download_dir = "/srv/lsnp"
            peer_timeout_ticks = 1200
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.chunk_size, 4096);
        assert_eq!(cfg.download_dir, PathBuf::from("/srv/lsnp"));
        assert_eq!(cfg.peer_timeout_ticks, Some(1200));
        assert_eq!(cfg.token_ttl_secs, DEFAULT_TOKEN_TTL_SECS);
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(toml::from_str::<CoreConfig>("retries = 2").is_err());
    }
}
