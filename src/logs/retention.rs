// SPDX-License-Identifier: Apache-2.0
//! Post-rotation eviction of compressed artifacts, driven by disk pressure
//! or a persistently failing uploader. Deliberately conservative: at most
//! one artifact per invocation, so progress never turns into thrashing.
use std::fs::{read_dir, remove_file};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};

use crate::config::Config;
use crate::control::Shared;
use crate::logs::rotator::artifact_millis;

pub struct RetentionConfig {
    pub upload_dev_dir: PathBuf,
    pub upload_app_dir: PathBuf,
    /// Eviction starts below this much free space on the persist filesystem.
    pub min_headroom_mb: u64,
    /// Eviction also starts once the uploader has been failing this long.
    pub disconnect_grace_sec: i64,
}

impl From<&Config> for RetentionConfig {
    fn from(config: &Config) -> Self {
        Self {
            upload_dev_dir: config.upload_dev_dir(),
            upload_app_dir: config.upload_app_dir(),
            min_headroom_mb: config.config_file.retention.min_headroom_mb,
            disconnect_grace_sec: config.config_file.retention.disconnect_grace_sec,
        }
    }
}

/// Evict at most one artifact from the stream's upload directory.
///
/// The whole computation runs in the millisecond domain of the artifact
/// names. Out of space: sweep forward from the midpoint of the retained
/// window. Disconnected: sweep forward from halfway into the grace period
/// after the failures started. Either way the victim is the artifact with
/// the smallest embedded time strictly above that point.
pub fn maybe_evict(
    config: &RetentionConfig,
    shared: &Shared,
    is_app: bool,
    now: DateTime<Utc>,
) -> Result<Option<PathBuf>> {
    let (failed_to_send, fail_start) = {
        let metrics = shared.metrics();
        (metrics.failed_to_send, metrics.fail_sent_start_time)
    };
    let out_of_space = shared.space_avail_mb.load(Ordering::Relaxed) < config.min_headroom_mb;
    if !failed_to_send && !out_of_space {
        return Ok(None);
    }

    let disconnected_too_long = failed_to_send
        && fail_start.is_some_and(|start| {
            now.signed_duration_since(start).num_seconds() >= config.disconnect_grace_sec
        });
    if !disconnected_too_long && !out_of_space {
        return Ok(None);
    }

    let dir = if is_app {
        &config.upload_app_dir
    } else {
        &config.upload_dev_dir
    };
    let artifacts = list_artifacts(dir, is_app)?;

    let now_ms = now.timestamp_millis();
    let initial_clean_ms = if out_of_space {
        let Some(oldest_ms) = artifacts.iter().map(|(ms, _)| *ms).min() else {
            return Ok(None);
        };
        (now_ms + oldest_ms) / 2
    } else {
        // Checked above; failed_to_send implies a start time here.
        let Some(start) = fail_start else {
            return Ok(None);
        };
        start.timestamp_millis() + config.disconnect_grace_sec * 1000 / 2
    };

    let victim = artifacts
        .into_iter()
        .filter(|(ms, _)| *ms > initial_clean_ms)
        .min_by_key(|(ms, _)| *ms);
    match victim {
        Some((_, path)) => {
            remove_file(&path)
                .wrap_err_with(|| format!("Unable to evict artifact {}", path.display()))?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

fn list_artifacts(dir: &Path, is_app: bool) -> Result<Vec<(i64, PathBuf)>> {
    let mut artifacts = Vec::new();
    for entry in read_dir(dir)
        .wrap_err_with(|| format!("Unable to read upload directory {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(millis) = artifact_millis(is_app, name) {
            artifacts.push((millis, entry.path()));
        }
    }
    Ok(artifacts)
}
