// SPDX-License-Identifier: Apache-2.0
//! Syslog datagram adapter. Owns the `/dev/log` unix socket and parses
//! RFC3164-style packets.
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, SecondsFormat, Utc};
use eyre::{eyre, Context, Result};
use lazy_static::lazy_static;
use log::{error, trace};
use regex::Regex;

use crate::control::Shared;
use crate::inputs::{severity_str, InputEntry};

lazy_static! {
    // <PRI>TIMESTAMP TAG[PID]: MSG - timestamps come in 15 and 25 char forms.
    static ref SYSLOG_RE: Regex = Regex::new("<([0-9]+)>(.{15}|.{25}) (.*?): (.*)")
        .expect("syslog regex must compile");
}

const MAX_PACKET_SIZE: usize = 4096;

/// Parse one syslog packet received at `received`.
fn parse_packet(packet: &str, received: DateTime<Utc>) -> Result<InputEntry> {
    let captures = SYSLOG_RE
        .captures(packet)
        .ok_or_else(|| eyre!("Unparsable syslog packet: {}", packet))?;

    let priority = captures[1].parse::<i64>().unwrap_or(-1);
    let misc = &captures[3];

    // Either "hostname tagpid" or bare "tagpid".
    let tagpid = match misc.split_once(' ') {
        Some((_hostname, tagpid)) => tagpid,
        None => misc,
    };
    let (tag, pid) = split_tag_pid(tagpid);

    // Raw message excluding priority, timestamp, tag and pid.
    let content = if let Some(idx) = packet.find("]: ") {
        packet[idx + 2..].trim()
    } else if let Some(idx) = packet.find(": ") {
        packet[idx + 1..].trim()
    } else {
        packet.trim()
    };

    Ok(InputEntry {
        source: tag,
        severity: severity_str(priority).to_string(),
        content: content.to_string(),
        pid: pid.to_string(),
        timestamp: received.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ..Default::default()
    })
}

/// `tagpid` is either `tag[pid]`, `[pid]` or just `tag`.
fn split_tag_pid(tagpid: &str) -> (String, i64) {
    match tagpid.find('[') {
        Some(n) if n > 0 || (tagpid.starts_with('[') && tagpid.ends_with(']')) => {
            let pid = tagpid[n + 1..]
                .trim_end_matches(']')
                .parse::<i64>()
                .unwrap_or(0);
            (tagpid[..n].to_string(), pid)
        }
        _ => (tagpid.to_string(), 0),
    }
}

/// Unlink any stale socket, bind fresh and open it up to every local writer.
fn bind_socket(path: &Path) -> Result<UnixDatagram> {
    let _ = fs::remove_file(path);
    let socket = UnixDatagram::bind(path)
        .wrap_err_with(|| format!("Unable to bind syslog socket {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
        .wrap_err_with(|| format!("Unable to chmod {}", path.display()))?;
    Ok(socket)
}

/// Spawn the adapter thread. A dead syslog listener is survivable - the
/// other two inputs keep flowing - so errors end the thread, not the process.
pub fn start(socket_path: PathBuf, ingress: SyncSender<InputEntry>, shared: Arc<Shared>) {
    thread::spawn(move || {
        if let Err(e) = run(&socket_path, &ingress, &shared) {
            error!("Syslog adapter stopped: {:#}", e);
        }
    });
}

fn run(socket_path: &Path, ingress: &SyncSender<InputEntry>, shared: &Shared) -> Result<()> {
    let socket = bind_socket(socket_path)?;
    let mut buf = [0u8; MAX_PACKET_SIZE];

    loop {
        let n = socket.recv(&mut buf).wrap_err("Syslog socket read error")?;
        let packet = String::from_utf8_lossy(&buf[..n]);

        let entry = match parse_packet(packet.trim_end_matches('\0'), Utc::now()) {
            Ok(entry) => entry,
            Err(e) => {
                error!("{:#}", e);
                continue;
            }
        };

        {
            let mut metrics = shared.metrics();
            metrics.num_syslog_messages += 1;
            metrics.dev.num_input_events += 1;
            trace!(
                "syslog entry ({}): {}",
                metrics.num_syslog_messages,
                entry.content
            );
        }

        ingress.send(entry).wrap_err("Ingress channel closed")?;
    }
}
