// SPDX-License-Identifier: Apache-2.0
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use log::{error, trace};

use crate::util::fs::create_collect_file;

/// Collect filename prefix for the device stream: `dev.<rand>`.
pub const DEV_PREFIX: &str = "dev.";
/// Collect filename prefix for app streams: `app.<uuid>.log.<rand>`.
pub const APP_PREFIX: &str = "app.";
/// Separator between the app uuid and the trailing random/millis part.
pub const APP_SUFFIX: &str = ".log.";

/// An open collect segment: one metadata header line followed by one JSON
/// event per line. Owned and mutated by the writer only.
pub struct Segment {
    file: File,
    path: PathBuf,
    /// Lines appended so far; drives the fsync cadence.
    index: u64,
    /// Bytes of event lines; the header line is not counted.
    size: u64,
    since: Instant,
}

impl Segment {
    fn open(collect_dir: &Path, prefix: &str, header: &str) -> Result<Self> {
        let (file, path) = create_collect_file(collect_dir, prefix)?;
        trace!("Now writing logs to: {}", path.display());
        let mut segment = Segment {
            file,
            path,
            index: 0,
            size: 0,
            since: Instant::now(),
        };
        segment
            .file
            .write_all(format!("{}\n", header).as_bytes())
            .wrap_err_with(|| format!("Unable to write metadata header to {}", segment.path.display()))?;
        Ok(segment)
    }

    pub fn open_device(collect_dir: &Path, header: &str) -> Result<Self> {
        Self::open(collect_dir, DEV_PREFIX, header)
    }

    pub fn open_app(collect_dir: &Path, app_uuid: &str, header: &str) -> Result<Self> {
        Self::open(
            collect_dir,
            &format!("{}{}{}", APP_PREFIX, app_uuid, APP_SUFFIX),
            header,
        )
    }

    /// Append one line (terminator included by the caller) and fsync every
    /// `sync_count` lines, the first line always included. Returns the bytes
    /// written. A failed fsync is reported but does not lose the line.
    pub fn append_line(&mut self, line: &str, sync_count: u64) -> Result<usize> {
        self.file
            .write_all(line.as_bytes())
            .wrap_err_with(|| format!("Segment write error on {}", self.path.display()))?;
        self.size += line.len() as u64;
        if self.index % sync_count.max(1) == 0 {
            if let Err(e) = self.file.sync_all() {
                error!("Segment fsync failed on {}: {}", self.path.display(), e);
            }
        }
        self.index += 1;
        Ok(line.len())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn age(&self) -> Duration {
        self.since.elapsed()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the segment, handing back what the rotator needs.
    pub fn close(self) -> (PathBuf, u64) {
        (self.path, self.size)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_is_the_first_line_and_not_counted() {
        let dir = tempdir().unwrap();
        let segment = Segment::open_device(dir.path(), "{\"DevID\":\"d-1\"}").unwrap();
        assert_eq!(segment.size(), 0);

        let content = read_to_string(segment.path()).unwrap();
        assert_eq!(content, "{\"DevID\":\"d-1\"}\n");
    }

    #[test]
    fn append_tracks_size_and_lines() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::open_device(dir.path(), "hdr").unwrap();

        assert_eq!(segment.append_line("{\"msgid\":1}\n", 30).unwrap(), 12);
        assert_eq!(segment.append_line("{\"msgid\":2}\n", 30).unwrap(), 12);
        assert_eq!(segment.size(), 24);
        assert_eq!(segment.index, 2);

        let content = read_to_string(segment.path()).unwrap();
        assert_eq!(content, "hdr\n{\"msgid\":1}\n{\"msgid\":2}\n");
    }

    #[test]
    fn app_segment_name_embeds_the_uuid() {
        let dir = tempdir().unwrap();
        let segment = Segment::open_app(dir.path(), "u-1", "app-a").unwrap();
        let name = segment.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("app.u-1.log."));
        assert_eq!(read_to_string(segment.path()).unwrap(), "app-a\n");
    }

    #[test]
    fn close_returns_path_and_size() {
        let dir = tempdir().unwrap();
        let mut segment = Segment::open_device(dir.path(), "hdr").unwrap();
        segment.append_line("x\n", 1).unwrap();
        let expected = segment.path().to_owned();
        let (path, size) = segment.close();
        assert_eq!(path, expected);
        assert_eq!(size, 2);
    }
}
