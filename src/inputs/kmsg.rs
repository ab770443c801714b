// SPDX-License-Identifier: Apache-2.0
//! Kernel message ring adapter. Streams `/dev/kmsg` records and forwards
//! them on the ingress channel with `source = "kernel"`.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use eyre::{eyre, Context, Result};
use log::{error, trace};

use crate::control::Shared;
use crate::inputs::{severity_str, InputEntry};

/// One parsed record from the kernel message ring.
#[derive(Debug, PartialEq, Eq)]
struct KmsgRecord {
    priority: i64,
    timestamp_usec: i64,
    message: String,
}

/// Parse one `/dev/kmsg` line: `<pri>,<seq>,<usec>,<flags>[,...];<message>`.
/// Continuation lines (leading space) carry no new message and yield None.
fn parse_kmsg_line(line: &str) -> Option<KmsgRecord> {
    if line.starts_with(' ') {
        return None;
    }
    let (meta, message) = line.split_once(';')?;
    let mut fields = meta.split(',');
    let priority = fields.next()?.parse::<i64>().unwrap_or(-1);
    let _seq = fields.next()?;
    let timestamp_usec = fields.next()?.parse::<i64>().ok()?;
    Some(KmsgRecord {
        priority,
        timestamp_usec,
        message: message.trim_end_matches('\n').to_string(),
    })
}

/// Wall-clock instant the system booted, from CLOCK_BOOTTIME. Ring record
/// timestamps are microseconds since this instant.
fn boot_wallclock() -> DateTime<Utc> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail with a valid clock id and timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    Utc::now() - Duration::seconds(ts.tv_sec) - Duration::nanoseconds(ts.tv_nsec)
}

fn entry_from_record(record: KmsgRecord, boot_time: DateTime<Utc>) -> InputEntry {
    let timestamp = boot_time + Duration::microseconds(record.timestamp_usec);
    InputEntry {
        source: "kernel".to_string(),
        severity: severity_str(record.priority).to_string(),
        content: record.message,
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ..Default::default()
    }
}

/// Spawn the adapter thread. Losing the kernel ring means losing events, so
/// any error here takes the process down for a supervised restart.
pub fn start(device: PathBuf, ingress: SyncSender<InputEntry>, shared: Arc<Shared>) {
    thread::spawn(move || {
        if let Err(e) = run(&device, &ingress, &shared) {
            error!("Fatal: kernel adapter: {:#}", e);
            std::process::exit(1);
        }
    });
}

fn run(device: &Path, ingress: &SyncSender<InputEntry>, shared: &Shared) -> Result<()> {
    let file = File::open(device)
        .wrap_err_with(|| format!("Unable to open kernel ring {}", device.display()))?;
    let boot_time = boot_wallclock();
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .wrap_err("Kernel ring read error")?;
        if n == 0 {
            return Err(eyre!("Kernel ring closed"));
        }

        let Some(record) = parse_kmsg_line(&line) else {
            continue;
        };
        let entry = entry_from_record(record, boot_time);

        {
            let mut metrics = shared.metrics();
            metrics.num_kmessages += 1;
            metrics.dev.num_input_events += 1;
            trace!(
                "kernel entry ({}): {}",
                metrics.num_kmessages,
                entry.content
            );
        }

        ingress.send(entry).wrap_err("Ingress channel closed")?;
    }
}
