// SPDX-License-Identifier: Apache-2.0
//! Daemon wiring: shared state, channels, one thread per component, with
//! the writer loop running on the calling thread.
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;

use eyre::Result;
use log::warn;

use crate::config::Config;
use crate::control::{self, ControlEvent, Shared};
use crate::inputs::{kmsg, memstream, syslog};
use crate::logs::retention::RetentionConfig;
use crate::logs::rotator::{self, RotatorConfig};
use crate::logs::writer::{LogWriter, LogWriterConfig};
use crate::metrics::{self, MetricsSink};
use crate::util::disk_size::available_space_mb;

/// Ingress entries waiting for the writer; producers block when full.
pub const INGRESS_CHANNEL_SIZE: usize = 10;
/// Closed segments waiting for the rotator; the writer blocks when full,
/// which in turn throttles its consumption of the three inputs.
pub const ROTATE_CHANNEL_SIZE: usize = 5;
/// Control events waiting for the dispatcher.
pub const CONTROL_CHANNEL_SIZE: usize = 32;

/// Run the daemon until the ingress channel closes. `control_events` is fed
/// by the external message bus; `sink` receives metrics snapshots.
pub fn run(
    config: &Config,
    control_events: Receiver<ControlEvent>,
    sink: Box<dyn MetricsSink>,
) -> Result<()> {
    let space_avail_mb = match available_space_mb(&config.config_file.persist_dir) {
        Ok(mb) => mb,
        Err(e) => {
            warn!("Initial free-space check failed: {:#}", e);
            0
        }
    };
    let shared = Arc::new(Shared::new(
        config.device_metadata(),
        config.rotate_timeouts().normal_sec,
        space_avail_mb,
    ));

    let (ingress_tx, ingress_rx) = sync_channel(INGRESS_CHANNEL_SIZE);
    let (rotate_tx, rotate_rx) = sync_channel(ROTATE_CHANNEL_SIZE);

    // The rotator must be draining before the writer's startup sweep can
    // enqueue more than the channel holds.
    rotator::start(
        RotatorConfig::from(config),
        RetentionConfig::from(config),
        shared.clone(),
        rotate_rx,
    );
    control::start_dispatcher(shared.clone(), config.rotate_timeouts(), control_events);
    metrics::start_publisher(shared.clone(), sink);

    let mut writer = LogWriter::open(LogWriterConfig::from(config), shared.clone(), rotate_tx)?;

    kmsg::start(
        config.config_file.kmsg_device.clone(),
        ingress_tx.clone(),
        shared.clone(),
    );
    memstream::start(
        config.config_file.memstream_socket.clone(),
        ingress_tx.clone(),
        shared.clone(),
    );
    syslog::start(config.config_file.syslog_socket.clone(), ingress_tx, shared);

    writer.run(ingress_rx)
}
