// SPDX-License-Identifier: Apache-2.0
//! The single-threaded writer: consumes the ingress channel, classifies each
//! entry, serializes it into the right segment and drives rotation.
use std::collections::HashMap;
use std::fs::create_dir_all;
use std::mem::replace;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{eyre, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::control::Shared;
use crate::inputs::InputEntry;
use crate::logs::classifier;
use crate::logs::log_entry::{LogRecord, Timestamp};
use crate::logs::recovery;
use crate::logs::rotator::CompressRequest;
use crate::logs::segment::Segment;
use crate::util::disk_size::available_space_mb;

/// Segment age and free space are checked on this cadence.
pub const CHECK_TICK: Duration = Duration::from_secs(5);
/// Free space is refreshed every 360th tick (half an hour).
const SPACE_CHECK_TICKS: u64 = 360;
/// How long the watchdog-imminent sync-every-line mode lasts.
const WATCHDOG_SYNC_WINDOW: Duration = Duration::from_secs(300);

/// First line of a device segment, preserved into the artifact gzip header.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceHeader {
    #[serde(rename = "DevID")]
    pub dev_id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "EveVersion")]
    pub version: String,
}

pub struct LogWriterConfig {
    pub collect_dir: PathBuf,
    pub upload_dev_dir: PathBuf,
    pub upload_app_dir: PathBuf,
    /// statvfs target for the free-space refresh.
    pub persist_dir: PathBuf,
    /// Segments rotate once their event bytes reach this.
    pub rotate_size: u64,
    /// Lines between fsyncs outside watchdog-imminent mode.
    pub default_sync_count: u64,
}

impl From<&Config> for LogWriterConfig {
    fn from(config: &Config) -> Self {
        Self {
            collect_dir: config.collect_dir(),
            upload_dev_dir: config.upload_dev_dir(),
            upload_app_dir: config.upload_app_dir(),
            persist_dir: config.config_file.persist_dir.clone(),
            rotate_size: config.config_file.logs.rotate_size,
            default_sync_count: config.default_sync_count(),
        }
    }
}

pub struct LogWriter {
    config: LogWriterConfig,
    shared: Arc<Shared>,
    rotate_tx: SyncSender<CompressRequest>,
    device: Segment,
    apps: HashMap<String, Segment>,
    /// Next message id; globally monotonic in writer order.
    msgid: u64,
    sync_count: u64,
    sync_reset_at: Option<Instant>,
    ticks: u64,
}

impl LogWriter {
    /// Prepare the collect area and open a fresh device segment. Segments
    /// from a previous life are handed to the rotator first, and orphaned
    /// rotation temps are removed.
    pub fn open(
        config: LogWriterConfig,
        shared: Arc<Shared>,
        rotate_tx: SyncSender<CompressRequest>,
    ) -> Result<Self> {
        create_dir_all(&config.collect_dir).wrap_err_with(|| {
            format!(
                "Unable to create collect directory {}",
                config.collect_dir.display()
            )
        })?;

        recovery::clean_rotation_temps(&config.upload_dev_dir);
        recovery::clean_rotation_temps(&config.upload_app_dir);
        recovery::sweep_previous_segments(&config.collect_dir, &rotate_tx)?;

        let header = device_header(&shared)?;
        let device = Segment::open_device(&config.collect_dir, &header)?;
        let sync_count = config.default_sync_count;

        Ok(Self {
            config,
            shared,
            rotate_tx,
            device,
            apps: HashMap::new(),
            msgid: 1,
            sync_count,
            sync_reset_at: None,
            ticks: 0,
        })
    }

    /// The writer loop: ingress entries, a 5-second check tick and the
    /// watchdog sync-count reset all rendezvous here.
    pub fn run(&mut self, ingress: Receiver<InputEntry>) -> Result<()> {
        let mut next_tick = Instant::now() + CHECK_TICK;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match ingress.recv_timeout(timeout) {
                Ok(entry) => self.handle_entry(entry)?,
                Err(RecvTimeoutError::Timeout) => {
                    self.handle_tick()?;
                    next_tick = Instant::now() + CHECK_TICK;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Ingress closed, writer shutting down");
                    return Ok(());
                }
            }
            self.restore_sync_count_if_due();
        }
    }

    fn handle_entry(&mut self, mut entry: InputEntry) -> Result<()> {
        if classifier::is_watchdog_imminent(&entry) {
            entry.severity = "emerg".to_string();
            self.sync_count = 1;
            self.sync_reset_at = Some(Instant::now() + WATCHDOG_SYNC_WINDOW);
        }

        let app_uuid = {
            let domains = self.shared.domains();
            classifier::classify(&mut entry, &domains)
        };

        let record = LogRecord {
            severity: entry.severity,
            source: entry.source.clone(),
            content: entry.content,
            iid: entry.pid,
            filename: entry.filename,
            msgid: self.msgid,
            function: entry.function,
            timestamp: Timestamp::from_rfc3339(&entry.timestamp)?,
        };
        let mut line = serde_json::to_string(&record).wrap_err("Unable to serialize log record")?;
        line.push('\n');
        self.msgid += 1;

        match app_uuid {
            Some(uuid) => self.append_app(&uuid, &line),
            None => self.append_device(&entry.source, &line),
        }
    }

    fn append_app(&mut self, uuid: &str, line: &str) -> Result<()> {
        if !self.apps.contains_key(uuid) {
            let header = self.app_header(uuid)?;
            let segment = Segment::open_app(&self.config.collect_dir, uuid, &header)?;
            self.apps.insert(uuid.to_string(), segment);
        }
        // NOTE: just inserted above when missing; this is better than panicking.
        let segment = self
            .apps
            .get_mut(uuid)
            .ok_or_else(|| eyre!("No segment for app {}", uuid))?;

        let written = segment.append_line(line, self.sync_count)?;
        self.shared.metrics().app.num_bytes_written += written as u64;

        if segment.size() >= self.config.rotate_size {
            self.rotate_app(uuid)?;
        }
        Ok(())
    }

    fn append_device(&mut self, source: &str, line: &str) -> Result<()> {
        let written = self.device.append_line(line, self.sync_count)?;
        *self
            .shared
            .dev_source_bytes()
            .entry(source.to_string())
            .or_insert(0) += written as u64;
        self.shared.metrics().dev.num_bytes_written += written as u64;

        if self.device.size() >= self.config.rotate_size {
            self.rotate_device()?;
        }
        Ok(())
    }

    /// Replace the device segment with a fresh one and enqueue the old one.
    fn rotate_device(&mut self) -> Result<()> {
        let header = device_header(&self.shared)?;
        let fresh = Segment::open_device(&self.config.collect_dir, &header)?;
        let closed = replace(&mut self.device, fresh);
        self.enqueue_rotation(closed, false)
    }

    /// App segments are not replaced; the next entry for the app recreates
    /// one (picking up a possibly renamed display name).
    fn rotate_app(&mut self, uuid: &str) -> Result<()> {
        if let Some(segment) = self.apps.remove(uuid) {
            self.enqueue_rotation(segment, true)?;
        }
        Ok(())
    }

    fn enqueue_rotation(&self, segment: Segment, is_app: bool) -> Result<()> {
        let (tmp_path, input_size) = segment.close();
        self.rotate_tx
            .send(CompressRequest {
                tmp_path,
                is_app,
                input_size,
            })
            .wrap_err("Rotate channel closed")?;
        Ok(())
    }

    fn handle_tick(&mut self) -> Result<()> {
        self.ticks += 1;

        let timeout = Duration::from_secs(
            self.shared.rotate_timeout_sec.load(Ordering::Relaxed) as u64
        );
        if self.device.size() > 0 && self.device.age() >= timeout {
            self.rotate_device()?;
        }
        let expired: Vec<String> = self
            .apps
            .iter()
            .filter(|(_, segment)| segment.size() > 0 && segment.age() >= timeout)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in expired {
            self.rotate_app(&uuid)?;
        }

        if self.ticks % SPACE_CHECK_TICKS == 0 {
            match available_space_mb(&self.config.persist_dir) {
                Ok(mb) => self.shared.space_avail_mb.store(mb, Ordering::Relaxed),
                Err(e) => warn!("statvfs failed, keeping last free-space value: {:#}", e),
            }
        }
        Ok(())
    }

    fn restore_sync_count_if_due(&mut self) {
        if let Some(reset_at) = self.sync_reset_at {
            if Instant::now() >= reset_at {
                self.sync_count = self.config.default_sync_count;
                self.sync_reset_at = None;
            }
        }
    }

    /// Display name for the app, or the device metadata line when the
    /// domain map does not know the uuid (yet).
    fn app_header(&self, uuid: &str) -> Result<String> {
        {
            let domains = self.shared.domains();
            if let Some(domain) = domains.values().find(|d| d.app_uuid == uuid) {
                return Ok(domain.app_name.clone());
            }
        }
        device_header(&self.shared)
    }
}

fn device_header(shared: &Shared) -> Result<String> {
    let device = shared.device();
    serde_json::to_string(&DeviceHeader {
        dev_id: device.uuid.clone(),
        image: device.current_partition.clone(),
        version: device.image_version.clone(),
    })
    .wrap_err("Unable to serialize device metadata header")
}
