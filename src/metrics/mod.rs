// SPDX-License-Identifier: Apache-2.0
//! Aggregated daemon counters and the jittered snapshot publisher.
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use log::{error, info};
use rand::{thread_rng, Rng};
use serde::Serialize;

use crate::control::Shared;

/// Mean publish interval; actual intervals are jittered down to 30% of it.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(300);
const JITTER_FLOOR: f64 = 0.3;
const TOP_SOURCES: usize = 10;

/// Per-stream (device or app) counters. The gzip upload side is mirrored
/// from the external uploader.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetrics {
    pub num_input_events: u64,
    pub num_bytes_written: u64,
    pub num_gzip_bytes_written: u64,
    pub num_gzip_files_sent: u64,
    pub num_gzip_files_in_dir: u32,
    pub num_gzip_file_retries: u32,
    pub recent_upload_timestamp: Option<DateTime<Utc>>,
    pub last_gzip_file_send_time: Option<DateTime<Utc>>,
    pub num_gzip_files_kept_local: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UploadLatency {
    pub min_upload_msec: u32,
    pub max_upload_msec: u32,
    pub avg_upload_msec: u32,
    pub curr_upload_msec: u32,
}

/// The published snapshot. Local collection counters are updated inline by
/// the component responsible; upload counters mirror the external uploader.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewlogMetrics {
    pub num_kmessages: u64,
    pub num_syslog_messages: u64,
    pub total_bytes_upload: u64,
    pub num_4xx_responses: u32,
    pub curr_upload_interval_sec: u32,
    pub logfile_timeout_sec: u32,
    pub max_gzip_size: u32,
    pub avg_gzip_size: u32,
    pub num_break_gzip_files: u32,
    pub failed_to_send: bool,
    pub fail_sent_start_time: Option<DateTime<Utc>>,
    pub latency: UploadLatency,
    pub dev: StreamMetrics,
    pub app: StreamMetrics,
    pub dev_top10_input_bytes_pct: HashMap<String, u32>,
}

/// Destination for published snapshots; the message bus in production, a
/// channel in tests.
pub trait MetricsSink: Send {
    fn publish(&mut self, snapshot: &NewlogMetrics) -> Result<()>;
}

/// Sink used by the shipped binary: the snapshot goes to the process log.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn publish(&mut self, snapshot: &NewlogMetrics) -> Result<()> {
        info!("metrics: {}", serde_json::to_string(snapshot)?);
        Ok(())
    }
}

/// Top contributors to device bytes, as integer percentages of the total.
pub fn dev_top_sources_pct(
    source_bytes: &HashMap<String, u64>,
    total_bytes: u64,
) -> HashMap<String, u32> {
    if total_bytes == 0 {
        return HashMap::new();
    }
    let mut ranked: Vec<(&String, &u64)> = source_bytes.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1));
    ranked
        .into_iter()
        .take(TOP_SOURCES)
        .map(|(source, bytes)| (source.clone(), (bytes * 100 / total_bytes) as u32))
        .collect()
}

fn jittered_interval(mean: Duration) -> Duration {
    mean.mul_f64(thread_rng().gen_range(JITTER_FLOOR..=1.0))
}

/// Assemble and publish one snapshot.
pub fn publish_once(shared: &Shared, sink: &mut dyn MetricsSink) -> Result<()> {
    let source_bytes = shared.dev_source_bytes().clone();
    let snapshot = {
        let mut metrics = shared.metrics();
        metrics.logfile_timeout_sec = shared.rotate_timeout_sec.load(Ordering::Relaxed);
        if metrics.dev.num_bytes_written > 0 {
            metrics.dev_top10_input_bytes_pct =
                dev_top_sources_pct(&source_bytes, metrics.dev.num_bytes_written);
        }
        metrics.clone()
    };
    sink.publish(&snapshot)
}

pub fn start_publisher(shared: Arc<Shared>, mut sink: Box<dyn MetricsSink>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(jittered_interval(PUBLISH_INTERVAL));
        if let Err(e) = publish_once(&shared, sink.as_mut()) {
            error!("Unable to publish metrics: {:#}", e);
        }
    })
}
