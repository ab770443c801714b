// SPDX-License-Identifier: Apache-2.0
//! Startup sweep: hand segments from a previous life to the rotator and
//! remove rotation temps orphaned by a crash mid-finalization.
use std::fs::{read_dir, remove_file};
use std::path::Path;
use std::sync::mpsc::SyncSender;

use eyre::{Context, Result};
use log::{debug, error};

use crate::logs::rotator::{CompressRequest, ROTATE_TMP_PREFIX};
use crate::logs::segment::{APP_PREFIX, DEV_PREFIX};
use crate::util::fs::has_prefixed_name;

/// Remove `TempFile*` leftovers from a rotation that never finished. A
/// missing directory just means nothing was ever rotated there.
pub fn clean_rotation_temps(dir: &Path) {
    let Ok(entries) = read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if has_prefixed_name(name, ROTATE_TMP_PREFIX) && entry.path().is_file() {
            debug!("Removing orphaned rotation temp {}", name);
            if let Err(e) = remove_file(entry.path()) {
                error!("Unable to remove rotation temp {}: {}", name, e);
            }
        }
    }
}

/// Enqueue every collect segment left behind by a previous life, as-is.
/// This is the tail end of the durability story: whatever was appended
/// before the process died still becomes an artifact.
pub fn sweep_previous_segments(
    collect_dir: &Path,
    rotate_tx: &SyncSender<CompressRequest>,
) -> Result<()> {
    for entry in read_dir(collect_dir)
        .wrap_err_with(|| format!("Unable to read collect directory {}", collect_dir.display()))?
    {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        let is_app = has_prefixed_name(name, APP_PREFIX);
        if !is_app && !has_prefixed_name(name, DEV_PREFIX) {
            continue;
        }
        debug!("Recovering segment from previous life: {}", name);
        rotate_tx
            .send(CompressRequest {
                tmp_path: entry.path(),
                is_app,
                input_size: metadata.len(),
            })
            .wrap_err("Rotate channel closed")?;
    }
    Ok(())
}
