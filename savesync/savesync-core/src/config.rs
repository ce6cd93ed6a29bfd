//! Runtime configuration for the sync core.

use serde::Deserialize;
use std::path::PathBuf;

/// Configuration shared by the store, the remote adapter and the coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Directory holding the local article store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between remote polls (default 30)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Retries for transient transport failures (default 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds, doubled per retry (default 500)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Per-request timeout in seconds (default 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub sync_enabled: bool,

    #[serde(default)]
    pub wifi_only: bool,
}

fn default_data_dir() -> PathBuf { PathBuf::from("./savesync-data") }
fn default_poll_interval() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff() -> u64 { 500 }
fn default_request_timeout() -> u64 { 30 }
fn default_true() -> bool { true }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_interval_secs: default_poll_interval(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            request_timeout_secs: default_request_timeout(),
            sync_enabled: true,
            wifi_only: false,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `SAVESYNC_*` environment variables. Values
    /// that fail to parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("SAVESYNC_") else {
                continue;
            };
            let applied = match name {
                "DATA_DIR" => {
                    config.data_dir = PathBuf::from(&value);
                    true
                }
                "POLL_INTERVAL_SECS" => parse_into(&value, &mut config.poll_interval_secs),
                "MAX_RETRIES" => parse_into(&value, &mut config.max_retries),
                "RETRY_BACKOFF_MS" => parse_into(&value, &mut config.retry_backoff_ms),
                "REQUEST_TIMEOUT_SECS" => parse_into(&value, &mut config.request_timeout_secs),
                "SYNC_ENABLED" => parse_into(&value, &mut config.sync_enabled),
                "WIFI_ONLY" => parse_into(&value, &mut config.wifi_only),
                _ => continue,
            };
            if !applied {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, value);
            }
        }
        config
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SyncConfig::from_vars(vars(&[
            ("SAVESYNC_POLL_INTERVAL_SECS", "5"),
            ("SAVESYNC_WIFI_ONLY", "true"),
            ("SAVESYNC_DATA_DIR", "/tmp/saves"),
            ("HOME", "/root"),
        ]));
        assert_eq!(config.poll_interval_secs, 5);
        assert!(config.wifi_only);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/saves"));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = SyncConfig::from_vars(vars(&[
            ("SAVESYNC_MAX_RETRIES", "lots"),
            ("SAVESYNC_SYNC_ENABLED", "maybe"),
        ]));
        assert_eq!(config.max_retries, 3);
        assert!(config.sync_enabled);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"wifi_only": true}"#).unwrap();
        assert!(config.wifi_only);
        assert!(config.sync_enabled);
        assert_eq!(config.retry_backoff_ms, 500);
    }
}
