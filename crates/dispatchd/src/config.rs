//! dispatchd.toml configuration parser.

use std::path::{Path, PathBuf};

use dispatch_placement::DispatchConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding `dispatch.redb`.
    pub data_dir: PathBuf,
    /// Whether this deployment serves the gray generation.
    pub gray_env: bool,
    pub log_format: LogFormat,
    #[serde(flatten)]
    pub dispatch: DispatchConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/dispatchd"),
            gray_env: false,
            log_format: LogFormat::Text,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dispatch.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.dispatch.pool.max_size, 100);
        assert_eq!(config.dispatch.selection.max_attempts, 200);
        assert_eq!(config.dispatch.rate_limit.max_in_flight, 1000);
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
data_dir = "/tmp/dispatch"
gray_env = true
idc_proxy = "http://idc-proxy.local"
log_format = "json"

[pool]
max_size = 8
lock_wait_ms = 250

[rate_limit]
max_in_flight = 50

[affinity]
ttl_secs = 3600

[selection]
max_attempts = 20
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/dispatch"));
        assert!(config.gray_env);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.dispatch.idc_proxy, "http://idc-proxy.local");
        assert_eq!(config.dispatch.pool.max_size, 8);
        assert_eq!(config.dispatch.pool.lock_lease_secs, 30);
        assert_eq!(config.dispatch.pool.lock_wait_ms, 250);
        assert_eq!(config.dispatch.rate_limit.max_in_flight, 50);
        assert_eq!(config.dispatch.rate_limit.key_prefix, "dispatch_docker_ip_count_");
        assert_eq!(config.dispatch.affinity.ttl_secs, 3600);
        assert_eq!(config.dispatch.selection.max_attempts, 20);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/dispatch/dispatch.redb"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatchd.toml");
        std::fs::write(&path, "gray_env = true\n[pool]\nmax_size = 3\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap();
        assert!(config.gray_env);
        assert_eq!(config.dispatch.pool.max_size, 3);
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(toml::from_str::<DaemonConfig>(r#"log_format = "xml""#).is_err());
    }
}
