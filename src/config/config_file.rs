// SPDX-License-Identifier: Apache-2.0
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// On-disk configuration. Every field is defaulted so an empty file (or no
/// file at all) yields the production settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EdgelogdConfig {
    /// Filesystem whose free space gates retention.
    pub persist_dir: PathBuf,
    /// Parent of the collect and upload directories.
    pub data_dir: PathBuf,
    pub kmsg_device: PathBuf,
    pub memstream_socket: PathBuf,
    pub syslog_socket: PathBuf,
    pub device: DeviceIdentityConfig,
    pub logs: LogsConfig,
    pub retention: RetentionSettings,
}

/// Identity baked into device segment headers. The device uuid is not here:
/// it arrives through the onboarding subscription.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct DeviceIdentityConfig {
    pub image_version: String,
    pub current_partition: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogsConfig {
    #[serde(rename = "rotate_size_bytes")]
    pub rotate_size: u64,
    #[serde(rename = "rotate_after_seconds")]
    pub rotate_after_sec: u32,
    #[serde(rename = "fast_rotate_after_seconds")]
    pub fast_rotate_after_sec: u32,
    #[serde(rename = "max_gzip_size_bytes")]
    pub max_gzip_size: u64,
    /// Lines between fsyncs of an open segment.
    pub sync_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetentionSettings {
    pub min_headroom_mb: u64,
    #[serde(rename = "disconnect_grace_seconds")]
    pub disconnect_grace_sec: i64,
}

impl Default for EdgelogdConfig {
    fn default() -> Self {
        Self {
            persist_dir: PathBuf::from("/persist"),
            data_dir: PathBuf::from("/persist/edgelog"),
            kmsg_device: PathBuf::from("/dev/kmsg"),
            memstream_socket: PathBuf::from("/run/memlogdq.sock"),
            syslog_socket: PathBuf::from("/dev/log"),
            device: DeviceIdentityConfig::default(),
            logs: LogsConfig::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            rotate_size: 550_000,
            rotate_after_sec: 300,
            fast_rotate_after_sec: 10,
            max_gzip_size: 50_000,
            sync_count: 30,
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            min_headroom_mb: 100,
            disconnect_grace_sec: 14_400,
        }
    }
}

impl EdgelogdConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = read_to_string(path)
            .wrap_err_with(|| format!("Unable to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .wrap_err_with(|| format!("Unable to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_carry_the_production_settings() {
        let config = EdgelogdConfig::default();
        assert_eq!(config.logs.rotate_size, 550_000);
        assert_eq!(config.logs.rotate_after_sec, 300);
        assert_eq!(config.logs.fast_rotate_after_sec, 10);
        assert_eq!(config.logs.max_gzip_size, 50_000);
        assert_eq!(config.logs.sync_count, 30);
        assert_eq!(config.retention.min_headroom_mb, 100);
        assert_eq!(config.retention.disconnect_grace_sec, 14_400);
        assert_eq!(config.syslog_socket, PathBuf::from("/dev/log"));
    }

    #[test]
    fn empty_object_is_a_valid_config() {
        let config: EdgelogdConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.logs.rotate_size, 550_000);
    }

    #[test]
    fn partial_overrides_keep_the_rest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edgelogd.conf");
        write(
            &path,
            r#"{
                "data_dir": "/tmp/edgelog-test",
                "logs": { "rotate_size_bytes": 1024 }
            }"#,
        )
        .unwrap();

        let config = EdgelogdConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/edgelog-test"));
        assert_eq!(config.logs.rotate_size, 1024);
        assert_eq!(config.logs.sync_count, 30);
        assert_eq!(config.persist_dir, PathBuf::from("/persist"));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edgelogd.conf");
        write(&path, "{ not json").unwrap();
        assert!(EdgelogdConfig::load(&path).is_err());
    }
}
