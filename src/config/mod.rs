// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use eyre::Result;

use crate::control::{DeviceMetadata, RotateTimeouts};

mod config_file;

pub use config_file::{DeviceIdentityConfig, EdgelogdConfig, LogsConfig, RetentionSettings};

const COLLECT_SUBDIRECTORY: &str = "collect";
const UPLOAD_DEV_SUBDIRECTORY: &str = "upload-dev";
const UPLOAD_APP_SUBDIRECTORY: &str = "upload-app";

/// Container of the entire daemon configuration. Module-specific views are
/// derived with `From<&Config>` (see `LogWriterConfig` for example).
pub struct Config {
    pub config_file: EdgelogdConfig,
    /// Started with `--restart`: the process is expected to go down again
    /// soon, so every line is synced to disk.
    pub restart: bool,
}

impl Config {
    pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/edgelogd.conf";

    pub fn read_from_system(user_config: Option<&Path>, restart: bool) -> Result<Self> {
        let path = user_config.unwrap_or_else(|| Path::new(Self::DEFAULT_CONFIG_PATH));
        let config_file = if path.exists() {
            EdgelogdConfig::load(path)?
        } else {
            EdgelogdConfig::default()
        };
        Ok(Self {
            config_file,
            restart,
        })
    }

    /// Open temp segments live here until rotation.
    pub fn collect_dir(&self) -> PathBuf {
        self.config_file.data_dir.join(COLLECT_SUBDIRECTORY)
    }

    pub fn upload_dev_dir(&self) -> PathBuf {
        self.config_file.data_dir.join(UPLOAD_DEV_SUBDIRECTORY)
    }

    pub fn upload_app_dir(&self) -> PathBuf {
        self.config_file.data_dir.join(UPLOAD_APP_SUBDIRECTORY)
    }

    pub fn default_sync_count(&self) -> u64 {
        if self.restart {
            1
        } else {
            self.config_file.logs.sync_count
        }
    }

    pub fn rotate_timeouts(&self) -> RotateTimeouts {
        RotateTimeouts {
            normal_sec: self.config_file.logs.rotate_after_sec,
            fast_sec: self.config_file.logs.fast_rotate_after_sec,
        }
    }

    /// Identity for device segment headers; the uuid stays empty until
    /// onboarding supplies it.
    pub fn device_metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            uuid: String::new(),
            image_version: self.config_file.device.image_version.clone(),
            current_partition: self.config_file.device.current_partition.clone(),
        }
    }
}
