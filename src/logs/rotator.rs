// SPDX-License-Identifier: Apache-2.0
//! Turns closed collect segments into compressed upload artifacts: strip the
//! metadata header line, gzip the body with the header carried in the gzip
//! header fields, finalize atomically, re-chunk oversized output.
use std::fs::{create_dir_all, read, remove_file};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Duration, Utc};
use eyre::{eyre, Context, Result};
use flate2::{Compression, GzBuilder};
use log::{debug, error, warn};
use tempfile::{Builder, NamedTempFile};

use crate::config::Config;
use crate::control::Shared;
use crate::logs::retention;
use crate::logs::segment::{APP_PREFIX, APP_SUFFIX, DEV_PREFIX};

/// Prefix of in-progress artifacts; orphans are swept at startup.
pub const ROTATE_TMP_PREFIX: &str = "TempFile";

/// A closed segment handed from the writer to the rotator. The writer
/// forgets the file once sent; only the rotator touches it from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressRequest {
    pub tmp_path: PathBuf,
    pub is_app: bool,
    pub input_size: u64,
}

pub struct RotatorConfig {
    pub upload_dev_dir: PathBuf,
    pub upload_app_dir: PathBuf,
    /// Artifacts above this size are split once at a line boundary, unless
    /// the halves would still be oversized.
    pub max_gzip_size: u64,
}

impl From<&Config> for RotatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            upload_dev_dir: config.upload_dev_dir(),
            upload_app_dir: config.upload_app_dir(),
            max_gzip_size: config.config_file.logs.max_gzip_size,
        }
    }
}

pub struct Rotator {
    config: RotatorConfig,
    shared: Arc<Shared>,
    /// Artifacts produced so far, for the running average.
    gzip_files_count: u64,
}

/// Device artifact name: `dev.<millis>.gz`.
pub fn dev_artifact_name(millis: i64) -> String {
    format!("{}{}.gz", DEV_PREFIX, millis)
}

/// App artifact name: `app.<uuid>.log.<millis>.gz`.
pub fn app_artifact_name(app_uuid: &str, millis: i64) -> String {
    format!("{}{}{}{}.gz", APP_PREFIX, app_uuid, APP_SUFFIX, millis)
}

/// Milliseconds embedded in an artifact name, or None when the name does not
/// belong to the given stream.
pub fn artifact_millis(is_app: bool, name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".gz")?;
    if is_app {
        let (_uuid, millis) = stem.strip_prefix(APP_PREFIX)?.split_once(APP_SUFFIX)?;
        millis.parse().ok()
    } else {
        stem.strip_prefix(DEV_PREFIX)?.parse().ok()
    }
}

/// Recover the app uuid from a collect segment name `app.<uuid>.log.<rand>`.
fn app_uuid_from_segment_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre!("Unreadable segment name: {}", path.display()))?;
    let (uuid, _) = name
        .strip_prefix(APP_PREFIX)
        .and_then(|rest| rest.split_once(".log"))
        .ok_or_else(|| eyre!("Not an app segment name: {}", name))?;
    Ok(uuid.to_string())
}

/// Split at the first newline at or after the midpoint; the newline stays
/// with the left half. A body with no boundary past the midpoint cannot be
/// split.
fn split_at_line_boundary(body: &[u8]) -> Result<(&[u8], &[u8])> {
    let mid = body.len() / 2;
    let offset = body[mid..]
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| eyre!("No line boundary in the second half of the segment"))?;
    let split = mid + offset + 1;
    Ok((&body[..split], &body[split..]))
}

impl Rotator {
    pub fn new(config: RotatorConfig, shared: Arc<Shared>) -> Self {
        Self {
            config,
            shared,
            gzip_files_count: 0,
        }
    }

    /// Compress one closed segment into its final artifact(s) and delete the
    /// segment. Aborting here (fatal error) leaves the segment in place for
    /// the next startup sweep.
    pub fn process(&mut self, request: &CompressRequest) -> Result<()> {
        let dir = if request.is_app {
            self.config.upload_app_dir.clone()
        } else {
            self.config.upload_dev_dir.clone()
        };
        create_dir_all(&dir)
            .wrap_err_with(|| format!("Unable to create upload directory {}", dir.display()))?;

        let app_uuid = if request.is_app {
            Some(app_uuid_from_segment_name(&request.tmp_path)?)
        } else {
            None
        };

        let content = read(&request.tmp_path)
            .wrap_err_with(|| format!("Unable to read segment {}", request.tmp_path.display()))?;
        let Some(header_end) = content.iter().position(|b| *b == b'\n') else {
            // A segment created moments before collection has no header yet.
            warn!(
                "No metadata line in {}, dropping it",
                request.tmp_path.display()
            );
            remove_file(&request.tmp_path).wrap_err_with(|| {
                format!("Unable to remove segment {}", request.tmp_path.display())
            })?;
            return Ok(());
        };
        let header = String::from_utf8_lossy(&content[..header_end]).into_owned();
        let body = &content[header_end + 1..];

        let now = Utc::now();
        let millis = now.timestamp_millis();
        let (tmp, size) = self.gzip_to_temp(&dir, body, &header, request.is_app, now)?;

        let max = self.config.max_gzip_size;
        let total_size = if size > max && size / 2 < max {
            // Re-chunk: two artifacts a millisecond apart, same header.
            drop(tmp);
            let (left, right) = split_at_line_boundary(body)?;

            let (tmp1, size1) = self.gzip_to_temp(&dir, left, &header, request.is_app, now)?;
            self.finalize(tmp1, &dir, request.is_app, app_uuid.as_deref(), millis)?;
            let (tmp2, size2) = self.gzip_to_temp(
                &dir,
                right,
                &header,
                request.is_app,
                now + Duration::seconds(1),
            )?;
            self.finalize(tmp2, &dir, request.is_app, app_uuid.as_deref(), millis + 1)?;

            self.shared.metrics().num_break_gzip_files += 1;
            self.record_gzip_size(size1);
            self.record_gzip_size(size2);
            size1 + size2
        } else {
            self.finalize(tmp, &dir, request.is_app, app_uuid.as_deref(), millis)?;
            self.record_gzip_size(size);
            size
        };

        {
            let mut metrics = self.shared.metrics();
            if request.is_app {
                metrics.app.num_gzip_bytes_written += total_size;
            } else {
                metrics.dev.num_gzip_bytes_written += total_size;
            }
        }

        remove_file(&request.tmp_path)
            .wrap_err_with(|| format!("Unable to remove segment {}", request.tmp_path.display()))?;
        Ok(())
    }

    /// Gzip `body` into a `TempFile*` temp in `dir` at best compression,
    /// with the metadata header in the gzip Name (app) or Comment (device)
    /// field. Returns the temp file and its compressed size, fsynced.
    fn gzip_to_temp(
        &self,
        dir: &Path,
        body: &[u8],
        header: &str,
        is_app: bool,
        mtime: DateTime<Utc>,
    ) -> Result<(NamedTempFile, u64)> {
        let tmp = Builder::new()
            .prefix(ROTATE_TMP_PREFIX)
            .tempfile_in(dir)
            .wrap_err_with(|| format!("Unable to create artifact temp in {}", dir.display()))?;

        let builder = GzBuilder::new().mtime(mtime.timestamp() as u32);
        let builder = if is_app {
            builder.filename(header)
        } else {
            builder.comment(header)
        };
        let file = tmp
            .as_file()
            .try_clone()
            .wrap_err("Unable to clone artifact temp handle")?;
        let mut encoder = builder.write(file, Compression::best());
        if let Err(e) = encoder.write_all(body) {
            // The artifact is still finalized with whatever made it in.
            error!("gzip body write error: {}", e);
        }
        let file = encoder.finish().wrap_err("Unable to finish gzip stream")?;
        file.sync_all().wrap_err("Unable to sync artifact temp")?;
        let size = file
            .metadata()
            .wrap_err("Unable to stat artifact temp")?
            .len();
        Ok((tmp, size))
    }

    /// Atomically rename a finished temp to its timestamp-keyed final name.
    fn finalize(
        &self,
        tmp: NamedTempFile,
        dir: &Path,
        is_app: bool,
        app_uuid: Option<&str>,
        millis: i64,
    ) -> Result<()> {
        let name = match (is_app, app_uuid) {
            (true, Some(uuid)) => app_artifact_name(uuid, millis),
            _ => dev_artifact_name(millis),
        };
        let target = dir.join(&name);
        tmp.persist(&target)
            .map_err(|e| eyre!("Unable to rename artifact to {}: {}", target.display(), e))?;
        debug!("New artifact: {}", target.display());
        Ok(())
    }

    fn record_gzip_size(&mut self, size: u64) {
        let mut metrics = self.shared.metrics();
        if size as u32 > metrics.max_gzip_size {
            metrics.max_gzip_size = size as u32;
        }
        let old_total = metrics.avg_gzip_size as u64 * self.gzip_files_count;
        self.gzip_files_count += 1;
        metrics.avg_gzip_size = ((old_total + size) / self.gzip_files_count) as u32;
    }
}

/// Consume rotate requests until the writer goes away. Retention runs after
/// every request, against the stream the request belonged to. Errors on this
/// path would silently drop events, so they abort the process.
pub fn start(
    config: RotatorConfig,
    retention_config: retention::RetentionConfig,
    shared: Arc<Shared>,
    requests: Receiver<CompressRequest>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut rotator = Rotator::new(config, shared.clone());
        for request in requests.iter() {
            if let Err(e) = rotator.process(&request) {
                error!("Fatal: rotation of {}: {:#}", request.tmp_path.display(), e);
                std::process::exit(1);
            }
            match retention::maybe_evict(&retention_config, &shared, request.is_app, Utc::now()) {
                Ok(Some(evicted)) => debug!("Evicted artifact {}", evicted.display()),
                Ok(None) => {}
                Err(e) => {
                    error!("Fatal: retention: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs::{read_dir, File};
    use std::io::Read;

    use flate2::read::GzDecoder;
    use rand::distributions::{Alphanumeric, DistString};
    use rstest::{fixture, rstest};
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::control::DeviceMetadata;

    struct RotatorFixture {
        dirs: TempDir,
        shared: Arc<Shared>,
        rotator: Rotator,
    }

    impl RotatorFixture {
        fn with_max_gzip_size(max_gzip_size: u64) -> Self {
            let dirs = tempdir().unwrap();
            let shared = Arc::new(Shared::new(DeviceMetadata::default(), 300, 10_000));
            let config = RotatorConfig {
                upload_dev_dir: dirs.path().join("upload-dev"),
                upload_app_dir: dirs.path().join("upload-app"),
                max_gzip_size,
            };
            let rotator = Rotator::new(config, shared.clone());
            Self {
                dirs,
                shared,
                rotator,
            }
        }

        fn write_segment(&self, name: &str, header: &str, lines: &[String]) -> CompressRequest {
            let path = self.dirs.path().join(name);
            let mut content = format!("{}\n", header);
            for line in lines {
                content.push_str(line);
                content.push('\n');
            }
            std::fs::write(&path, &content).unwrap();
            CompressRequest {
                tmp_path: path,
                is_app: name.starts_with(APP_PREFIX),
                input_size: content.len() as u64,
            }
        }

        fn upload_files(&self, is_app: bool) -> Vec<PathBuf> {
            let dir = if is_app {
                self.dirs.path().join("upload-app")
            } else {
                self.dirs.path().join("upload-dev")
            };
            let mut files: Vec<PathBuf> = read_dir(dir)
                .into_iter()
                .flatten()
                .flatten()
                .map(|e| e.path())
                .collect();
            files.sort();
            files
        }
    }

    #[fixture]
    fn fixture() -> RotatorFixture {
        RotatorFixture::with_max_gzip_size(50_000)
    }

    /// Decompressed content plus the gzip Name and Comment header fields.
    fn decode_artifact(path: &Path) -> (String, Option<String>, Option<String>) {
        let mut decoder = GzDecoder::new(File::open(path).unwrap());
        let mut content = String::new();
        decoder.read_to_string(&mut content).unwrap();
        let header = decoder.header().unwrap();
        let name = header
            .filename()
            .map(|b| String::from_utf8_lossy(b).into_owned());
        let comment = header
            .comment()
            .map(|b| String::from_utf8_lossy(b).into_owned());
        (content, name, comment)
    }

    #[rstest]
    fn device_artifact_carries_header_in_comment(mut fixture: RotatorFixture) {
        let request = fixture.write_segment(
            "dev.abc123",
            "{\"DevID\":\"d-1\"}",
            &["line one".to_string(), "line two".to_string()],
        );
        fixture.rotator.process(&request).unwrap();

        let files = fixture.upload_files(false);
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap();
        assert!(artifact_millis(false, name).is_some());

        let (content, gz_name, gz_comment) = decode_artifact(&files[0]);
        assert_eq!(content, "line one\nline two\n");
        assert_eq!(gz_comment.as_deref(), Some("{\"DevID\":\"d-1\"}"));
        assert_eq!(gz_name, None);

        // The source segment is gone once the artifact is in place.
        assert!(!request.tmp_path.exists());
    }

    #[rstest]
    fn app_artifact_carries_header_in_name(mut fixture: RotatorFixture) {
        let app_uuid = uuid::Uuid::new_v4().to_string();
        let request = fixture.write_segment(
            &format!("app.{}.log.xyz", app_uuid),
            "app-a",
            &["{\"msgid\":1}".to_string()],
        );
        fixture.rotator.process(&request).unwrap();

        let files = fixture.upload_files(true);
        assert_eq!(files.len(), 1);
        let name = files[0].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("app.{}.log.", app_uuid)));
        assert!(artifact_millis(true, name).is_some());

        let (content, gz_name, _) = decode_artifact(&files[0]);
        assert_eq!(content, "{\"msgid\":1}\n");
        assert_eq!(gz_name.as_deref(), Some("app-a"));
    }

    #[rstest]
    fn no_rotation_temp_survives_a_rotation(mut fixture: RotatorFixture) {
        let request =
            fixture.write_segment("dev.abc", "hdr", &["payload".to_string()]);
        fixture.rotator.process(&request).unwrap();

        for file in fixture.upload_files(false) {
            let name = file.file_name().unwrap().to_str().unwrap();
            assert!(!name.starts_with(ROTATE_TMP_PREFIX));
        }
    }

    #[rstest]
    fn headerless_segment_is_dropped_with_no_artifact(mut fixture: RotatorFixture) {
        let path = fixture.dirs.path().join("dev.empty");
        std::fs::write(&path, "no newline at all").unwrap();
        let request = CompressRequest {
            tmp_path: path.clone(),
            is_app: false,
            input_size: 17,
        };
        fixture.rotator.process(&request).unwrap();

        assert!(!path.exists());
        assert!(fixture.upload_files(false).is_empty());
    }

    fn incompressible_lines(count: usize, width: usize) -> Vec<String> {
        (0..count)
            .map(|_| Alphanumeric.sample_string(&mut rand::thread_rng(), width))
            .collect()
    }

    #[rstest]
    fn oversized_artifact_splits_into_two() {
        // 120k of alphanumeric noise compresses to roughly 90k, landing
        // between max and 2*max: exactly one split.
        let mut fixture = RotatorFixture::with_max_gzip_size(60_000);
        let request = fixture.write_segment(
            "dev.big",
            "{\"DevID\":\"d-1\"}",
            &incompressible_lines(60, 2000),
        );
        fixture.rotator.process(&request).unwrap();

        let files = fixture.upload_files(false);
        assert_eq!(files.len(), 2);
        let millis: Vec<i64> = files
            .iter()
            .map(|f| artifact_millis(false, f.file_name().unwrap().to_str().unwrap()).unwrap())
            .collect();
        assert_eq!(millis[1], millis[0] + 1);

        let (left, _, comment_left) = decode_artifact(&files[0]);
        let (right, _, comment_right) = decode_artifact(&files[1]);
        assert_eq!(comment_left.as_deref(), Some("{\"DevID\":\"d-1\"}"));
        assert_eq!(comment_left, comment_right);
        // Both halves end on line boundaries and concatenate to the body.
        assert!(left.ends_with('\n'));
        assert_eq!(left.len() + right.len(), 60 * 2001);

        assert_eq!(fixture.shared.metrics().num_break_gzip_files, 1);
    }

    #[rstest]
    fn hopelessly_oversized_artifact_is_kept_whole() {
        // Halving 120k of incompressible data cannot get under 1k.
        let mut fixture = RotatorFixture::with_max_gzip_size(1_000);
        let request = fixture.write_segment(
            "dev.big",
            "hdr",
            &incompressible_lines(60, 2000),
        );
        fixture.rotator.process(&request).unwrap();

        assert_eq!(fixture.upload_files(false).len(), 1);
        assert_eq!(fixture.shared.metrics().num_break_gzip_files, 0);
    }

    #[rstest]
    fn gzip_size_stats_track_max_and_average(mut fixture: RotatorFixture) {
        let small = fixture.write_segment("dev.s1", "hdr", &["tiny".to_string()]);
        fixture.rotator.process(&small).unwrap();
        let bigger = fixture.write_segment("dev.s2", "hdr", &incompressible_lines(5, 400));
        fixture.rotator.process(&bigger).unwrap();

        let metrics = fixture.shared.metrics();
        assert!(metrics.max_gzip_size > 0);
        assert!(metrics.avg_gzip_size > 0);
        assert!(metrics.avg_gzip_size <= metrics.max_gzip_size);
        assert!(metrics.dev.num_gzip_bytes_written > 0);
    }

    #[rstest]
    #[case::device(false, "dev.1700000000000.gz", Some(1700000000000))]
    #[case::device_not_gz(false, "dev.1700000000000", None)]
    #[case::device_not_a_number(false, "dev.TempFile3.gz", None)]
    #[case::app(true, "app.u-1.log.1700000000001.gz", Some(1700000000001))]
    #[case::app_missing_suffix(true, "app.u-1.1700000000001.gz", None)]
    #[case::wrong_stream(true, "dev.1700000000000.gz", None)]
    fn artifact_name_parsing(
        #[case] is_app: bool,
        #[case] name: &str,
        #[case] expected: Option<i64>,
    ) {
        assert_eq!(artifact_millis(is_app, name), expected);
    }

    #[test]
    fn segment_name_yields_app_uuid() {
        assert_eq!(
            app_uuid_from_segment_name(Path::new("/collect/app.u-42.log.x7y")).unwrap(),
            "u-42"
        );
        assert!(app_uuid_from_segment_name(Path::new("/collect/dev.x7y")).is_err());
    }
}
