// SPDX-License-Identifier: Apache-2.0
use std::fs::File;
use std::path::{Path, PathBuf};

use eyre::{eyre, Context, Result};
use tempfile::Builder;

/// Create a new collect file `<prefix><rand>` in `dir` and keep it on disk.
/// `tempfile` picks the random suffix and creates the file with mode 0600.
pub fn create_collect_file(dir: &Path, prefix: &str) -> Result<(File, PathBuf)> {
    let tmpfile = Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .wrap_err_with(|| format!("Unable to create {}* in {}", prefix, dir.display()))?;
    tmpfile
        .keep()
        .map_err(|e| eyre!("Unable to keep collect file: {}", e))
}

/// True when `name` is `<prefix><something>` - a bare prefix does not count.
pub fn has_prefixed_name(name: &str, prefix: &str) -> bool {
    name.starts_with(prefix) && name.len() > prefix.len()
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collect_file_gets_prefix_and_private_mode() {
        let dir = tempdir().unwrap();
        let (file, path) = create_collect_file(dir.path(), "dev.").unwrap();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("dev."));
        assert!(name.len() > "dev.".len());
        assert_eq!(file.metadata().unwrap().permissions().mode() & 0o777, 0o600);
        assert!(path.exists());
    }

    #[test]
    fn two_collect_files_do_not_collide() {
        let dir = tempdir().unwrap();
        let (_, a) = create_collect_file(dir.path(), "dev.").unwrap();
        let (_, b) = create_collect_file(dir.path(), "dev.").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_match_requires_a_suffix() {
        assert!(has_prefixed_name("dev.x7Gh2", "dev."));
        assert!(!has_prefixed_name("dev.", "dev."));
        assert!(!has_prefixed_name("app.u1", "dev."));
    }
}
