// SPDX-License-Identifier: Apache-2.0
//! Process-wide state mutated by the external message bus and read by the
//! collection pipeline, plus the dispatcher applying bus events to it.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use log::{info, trace};

use crate::metrics::{NewlogMetrics, StreamMetrics, UploadLatency};

/// Domain-name mapping target: the app tenant and its display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDomain {
    pub app_uuid: String,
    pub app_name: String,
}

/// Identity written into device segment headers. The uuid may be empty
/// until onboarding reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub uuid: String,
    pub image_version: String,
    pub current_partition: String,
}

/// The one record of shared mutable state. Control-plane handlers mutate;
/// the writer, rotator and publisher read. Writer-exclusive state
/// (segments, msgid, sync count) lives in the writer itself.
pub struct Shared {
    domains: RwLock<HashMap<String, AppDomain>>,
    device: RwLock<DeviceMetadata>,
    metrics: Mutex<NewlogMetrics>,
    /// Cumulative bytes per device source; mutated only by the writer.
    dev_source_bytes: Mutex<HashMap<String, u64>>,
    /// Current time-based rotation threshold, in seconds.
    pub rotate_timeout_sec: AtomicU32,
    /// Last observed free space on the persist filesystem.
    pub space_avail_mb: AtomicU64,
}

impl Shared {
    pub fn new(device: DeviceMetadata, rotate_timeout_sec: u32, space_avail_mb: u64) -> Self {
        let metrics = NewlogMetrics {
            logfile_timeout_sec: rotate_timeout_sec,
            ..Default::default()
        };
        Self {
            domains: RwLock::new(HashMap::new()),
            device: RwLock::new(device),
            metrics: Mutex::new(metrics),
            dev_source_bytes: Mutex::new(HashMap::new()),
            rotate_timeout_sec: AtomicU32::new(rotate_timeout_sec),
            space_avail_mb: AtomicU64::new(space_avail_mb),
        }
    }

    // A poisoned lock means another thread died mid-update; nothing here can
    // recover from that, so these panic and take the process down.

    pub fn domains(&self) -> RwLockReadGuard<'_, HashMap<String, AppDomain>> {
        self.domains.read().expect("Fatal: domain map is poisoned")
    }

    pub fn domains_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, AppDomain>> {
        self.domains.write().expect("Fatal: domain map is poisoned")
    }

    pub fn device(&self) -> RwLockReadGuard<'_, DeviceMetadata> {
        self.device
            .read()
            .expect("Fatal: device metadata is poisoned")
    }

    pub fn device_mut(&self) -> RwLockWriteGuard<'_, DeviceMetadata> {
        self.device
            .write()
            .expect("Fatal: device metadata is poisoned")
    }

    pub fn metrics(&self) -> MutexGuard<'_, NewlogMetrics> {
        self.metrics.lock().expect("Fatal: metrics are poisoned")
    }

    pub fn dev_source_bytes(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.dev_source_bytes
            .lock()
            .expect("Fatal: source byte map is poisoned")
    }
}

/// Uploader-side counters mirrored into the local snapshot.
#[derive(Debug, Clone, Default)]
pub struct UploaderStats {
    pub total_bytes_upload: u64,
    pub num_4xx_responses: u32,
    pub curr_upload_interval_sec: u32,
    pub latency: UploadLatency,
    pub failed_to_send: bool,
    pub fail_sent_start_time: Option<DateTime<Utc>>,
    pub dev: StreamUploadStats,
    pub app: StreamUploadStats,
}

#[derive(Debug, Clone, Default)]
pub struct StreamUploadStats {
    pub num_gzip_files_sent: u64,
    pub num_gzip_files_in_dir: u32,
    pub num_gzip_file_retries: u32,
    pub recent_upload_timestamp: Option<DateTime<Utc>>,
    pub last_gzip_file_send_time: Option<DateTime<Utc>>,
    pub num_gzip_files_kept_local: u32,
}

/// State updates delivered by the external message bus.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    DomainStatus {
        domain_name: String,
        app_uuid: String,
        app_name: String,
    },
    DomainStatusDelete {
        domain_name: String,
    },
    OnboardingStatus {
        device_uuid: String,
    },
    GlobalConfig {
        allow_log_fastupload: bool,
    },
    UploadMetrics(UploaderStats),
}

/// Rotation timeouts selected by the `allow-log-fastupload` option.
#[derive(Debug, Clone, Copy)]
pub struct RotateTimeouts {
    pub normal_sec: u32,
    pub fast_sec: u32,
}

pub fn apply_event(shared: &Shared, timeouts: RotateTimeouts, event: ControlEvent) {
    match event {
        ControlEvent::DomainStatus {
            domain_name,
            app_uuid,
            app_name,
        } => {
            trace!("domain status: {} -> {}", domain_name, app_uuid);
            shared
                .domains_mut()
                .insert(domain_name, AppDomain { app_uuid, app_name });
        }
        ControlEvent::DomainStatusDelete { domain_name } => {
            trace!("domain status delete: {}", domain_name);
            shared.domains_mut().remove(&domain_name);
        }
        ControlEvent::OnboardingStatus { device_uuid } => {
            let mut device = shared.device_mut();
            if device.uuid == device_uuid {
                trace!("onboarding: no change to {}", device.uuid);
                return;
            }
            info!("onboarding: device uuid changed to {}", device_uuid);
            device.uuid = device_uuid;
        }
        ControlEvent::GlobalConfig {
            allow_log_fastupload,
        } => {
            let timeout_sec = if allow_log_fastupload {
                timeouts.fast_sec
            } else {
                timeouts.normal_sec
            };
            // Only the threshold changes here. An open segment keeps its
            // age and rolls on the writer's next 5-second check.
            shared
                .rotate_timeout_sec
                .store(timeout_sec, std::sync::atomic::Ordering::Relaxed);
            trace!("fastupload {} -> timeout {}s", allow_log_fastupload, timeout_sec);
        }
        ControlEvent::UploadMetrics(stats) => {
            let mut metrics = shared.metrics();
            metrics.total_bytes_upload = stats.total_bytes_upload;
            metrics.num_4xx_responses = stats.num_4xx_responses;
            metrics.curr_upload_interval_sec = stats.curr_upload_interval_sec;
            metrics.latency = stats.latency;
            metrics.failed_to_send = stats.failed_to_send;
            metrics.fail_sent_start_time = stats.fail_sent_start_time;
            mirror_stream(&mut metrics.dev, &stats.dev);
            mirror_stream(&mut metrics.app, &stats.app);
        }
    }
}

fn mirror_stream(target: &mut StreamMetrics, stats: &StreamUploadStats) {
    target.num_gzip_files_sent = stats.num_gzip_files_sent;
    target.num_gzip_files_in_dir = stats.num_gzip_files_in_dir;
    target.num_gzip_file_retries = stats.num_gzip_file_retries;
    target.recent_upload_timestamp = stats.recent_upload_timestamp;
    target.last_gzip_file_send_time = stats.last_gzip_file_send_time;
    target.num_gzip_files_kept_local = stats.num_gzip_files_kept_local;
}

/// Drain bus events onto the shared state until the bus goes away.
pub fn start_dispatcher(
    shared: Arc<Shared>,
    timeouts: RotateTimeouts,
    events: Receiver<ControlEvent>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events.iter() {
            apply_event(&shared, timeouts, event);
        }
        trace!("Control channel closed");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::TimeZone;

    use super::*;

    fn shared() -> Shared {
        Shared::new(DeviceMetadata::default(), 300, 10_000)
    }

    fn timeouts() -> RotateTimeouts {
        RotateTimeouts {
            normal_sec: 300,
            fast_sec: 10,
        }
    }

    #[test]
    fn domain_status_inserts_and_deletes() {
        let shared = shared();
        apply_event(
            &shared,
            timeouts(),
            ControlEvent::DomainStatus {
                domain_name: "dom42".to_string(),
                app_uuid: "u-1".to_string(),
                app_name: "app-a".to_string(),
            },
        );
        assert_eq!(shared.domains()["dom42"].app_uuid, "u-1");

        apply_event(
            &shared,
            timeouts(),
            ControlEvent::DomainStatusDelete {
                domain_name: "dom42".to_string(),
            },
        );
        assert!(shared.domains().is_empty());
        // Deleting a domain twice is not an error.
        apply_event(
            &shared,
            timeouts(),
            ControlEvent::DomainStatusDelete {
                domain_name: "dom42".to_string(),
            },
        );
    }

    #[test]
    fn onboarding_sets_the_device_uuid() {
        let shared = shared();
        apply_event(
            &shared,
            timeouts(),
            ControlEvent::OnboardingStatus {
                device_uuid: "d-77".to_string(),
            },
        );
        assert_eq!(shared.device().uuid, "d-77");
    }

    #[test]
    fn fastupload_updates_the_timeout_cell_only() {
        let shared = shared();
        apply_event(
            &shared,
            timeouts(),
            ControlEvent::GlobalConfig {
                allow_log_fastupload: true,
            },
        );
        assert_eq!(shared.rotate_timeout_sec.load(Ordering::Relaxed), 10);

        apply_event(
            &shared,
            timeouts(),
            ControlEvent::GlobalConfig {
                allow_log_fastupload: false,
            },
        );
        assert_eq!(shared.rotate_timeout_sec.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn upload_metrics_are_mirrored() {
        let shared = shared();
        let fail_start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        apply_event(
            &shared,
            timeouts(),
            ControlEvent::UploadMetrics(UploaderStats {
                total_bytes_upload: 1234,
                failed_to_send: true,
                fail_sent_start_time: Some(fail_start),
                dev: StreamUploadStats {
                    num_gzip_files_sent: 9,
                    ..Default::default()
                },
                ..Default::default()
            }),
        );

        let metrics = shared.metrics();
        assert_eq!(metrics.total_bytes_upload, 1234);
        assert!(metrics.failed_to_send);
        assert_eq!(metrics.fail_sent_start_time, Some(fail_start));
        assert_eq!(metrics.dev.num_gzip_files_sent, 9);
    }
}
