// SPDX-License-Identifier: Apache-2.0
use std::{ffi::CString, mem, os::unix::prelude::OsStrExt, path::Path};

use eyre::{eyre, Result};

/// Space available to unprivileged users on the filesystem backing `path`,
/// in megabytes. Callers keep their last known value when this fails.
// We need to cast to u64 here on some platforms.
#[allow(clippy::unnecessary_cast)]
pub fn available_space_mb(path: &Path) -> Result<u64> {
    let mut stat: libc::statvfs = unsafe { mem::zeroed() };
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| eyre!("Invalid path"))?;
    // danburkert/fs2-rs#1: cast is necessary for platforms where c_char != u8.
    if unsafe { libc::statvfs(cpath.as_ptr() as *const _, &mut stat) } != 0 {
        Err(eyre!("Unable to call statvfs"))
    } else {
        // f_bavail rather than f_bfree: blocks available to normal users,
        // not the superuser reserve.
        Ok(stat.f_frsize as u64 * stat.f_bavail as u64 / 1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reports_space_for_a_real_directory() {
        let tmp = tempdir().unwrap();
        // Any writable filesystem has at least some space available.
        assert!(available_space_mb(tmp.path()).is_ok());
    }

    #[test]
    fn fails_for_a_missing_path() {
        assert!(available_space_mb(Path::new("/nonexistent-edgelogd-test")).is_err());
    }
}
