// SPDX-License-Identifier: Apache-2.0
//! Memlogd stream adapter. Asks the in-memory log daemon to stream its
//! queue, then normalizes each newline-delimited record - repairing bodies
//! that are not well-formed structured logs along the way.
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eyre::{Context, Result};
use lazy_static::lazy_static;
use log::error;
use regex::Regex;
use serde::Deserialize;

use crate::control::Shared;
use crate::inputs::InputEntry;

/// A single byte of value 2 asks memlogd to start streaming its queue.
const STREAM_REQUEST: u8 = 2;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_RETRY: Duration = Duration::from_secs(5);

lazy_static! {
    static ref ANSI_RE: Regex = Regex::new(
        "[\u{0009}\u{001B}\u{009B}][\\[\\]()#;?]*(?:(?:(?:[a-zA-Z\\d]*(?:;[a-zA-Z\\d]*)*)?\u{0007})|(?:(?:\\d{1,4}(?:;\\d{0,4})*)?[\\dA-PRZcf-ntqry=><~]))"
    )
    .expect("ansi regex must compile");
}

/// Structured log body as emitted by the local agents. Parsing this is a
/// pure function of the record body; missing fields default to empty.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct LogInfo {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default, rename = "file")]
    pub filename: String,
    #[serde(default, rename = "func")]
    pub function: String,
    #[serde(default)]
    pub appuuid: String,
    #[serde(default)]
    pub containername: String,
    #[serde(default)]
    pub eventtime: String,
}

pub fn parse_log_info(body: &str) -> Option<LogInfo> {
    serde_json::from_str(body).ok()
}

/// Split a memlogd record `...,<time>,<source>;<body>` into
/// `(source, time, body)`. Missing pieces come back empty.
fn split_stream_header(record: &str) -> (String, String, String) {
    let Some((header, body)) = record.split_once(';') else {
        return (String::new(), String::new(), String::new());
    };
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 2 {
        return (String::new(), String::new(), body.to_string());
    }
    (
        fields[fields.len() - 1].to_string(),
        fields[fields.len() - 2].to_string(),
        body.to_string(),
    )
}

fn strip_ansi(s: &str) -> String {
    ANSI_RE
        .replace_all(s, "")
        .trim_matches('\r')
        .trim_matches('\n')
        .to_string()
}

/// Rebuild a LogInfo from a body that did not parse as structured log.
/// Oversized JSON gets its `msg` tail split off and reattached; logfmt-style
/// text is scanned for `level=` and `msg="..."`; anything else is preserved
/// verbatim at severity `info`.
pub fn repair_log_info(content: &str, saved_timestamp: &str, source_name: &str) -> LogInfo {
    let stripped = strip_ansi(content);
    let mut info = LogInfo {
        time: saved_timestamp.to_string(),
        source: source_name.to_string(),
        ..Default::default()
    };
    let mut ok = false;

    match stripped.split_once(",\"msg\":") {
        None => {
            let mut severity = String::new();
            let mut message = String::new();
            if let Some((_, rest)) = content.split_once("level=") {
                severity = rest.split(' ').next().unwrap_or_default().to_string();
            }
            if let Some((_, rest)) = content.split_once("msg=") {
                let quoted: Vec<&str> = rest.split('"').collect();
                if quoted.len() == 3 {
                    message = quoted[1].to_string();
                }
            }
            if !severity.is_empty() || !message.is_empty() {
                info.level = severity;
                info.msg = message;
                ok = true;
            }
        }
        Some((left, right)) => {
            let mut left = left.to_string();
            if !left.ends_with('}') {
                left.push('}');
            }
            if let Some(parsed) = parse_log_info(&left) {
                info = parsed;
                info.msg = right.to_string();
                ok = true;
            }
        }
    }

    if !ok {
        info.level = "info".to_string();
        info.msg = content.to_string();
    }
    info
}

/// Normalize one raw record. The bool is true when the record belongs to an
/// application (guest VM marker anywhere in the record, or a container name
/// in the parsed body).
pub fn normalize_record(record: &str) -> (InputEntry, bool) {
    let (source_name, msg_time, body) = split_stream_header(record);
    let parsed = parse_log_info(&body);

    let mut is_app = false;
    let mut info = parsed.clone().unwrap_or_default();
    if record.contains("guest_vm") {
        info.source = source_name.clone();
        info.msg = body.clone();
        is_app = true;
    } else if !info.containername.is_empty() {
        is_app = true;
    }

    if parsed.is_none() {
        info = repair_log_info(&body, &msg_time, &source_name);
    }
    if info.msg.is_empty() {
        info.msg = body;
    }
    if !is_app && info.source.is_empty() {
        info.source = source_name;
    }
    if info.time.is_empty() && msg_time.ends_with('Z') {
        info.time = msg_time;
    }
    let pid = if info.pid != 0 {
        info.pid.to_string()
    } else {
        String::new()
    };

    let entry = InputEntry {
        source: info.source,
        content: info.msg,
        pid,
        timestamp: info.time,
        function: info.function,
        filename: info.filename,
        severity: info.level,
        app_uuid: info.appuuid,
        ac_name: info.containername,
        ac_log_time: info.eventtime,
    };
    (entry, is_app)
}

/// Spawn the adapter thread. The memlogd stream carries most of the device's
/// own services, so losing it takes the process down for a restart.
pub fn start(socket_path: PathBuf, ingress: SyncSender<InputEntry>, shared: Arc<Shared>) {
    thread::spawn(move || {
        if let Err(e) = run(&socket_path, &ingress, &shared) {
            error!("Fatal: memstream adapter: {:#}", e);
            std::process::exit(1);
        }
    });
}

fn run(socket_path: &Path, ingress: &SyncSender<InputEntry>, shared: &Shared) -> Result<()> {
    let mut stream = UnixStream::connect(socket_path)
        .wrap_err_with(|| format!("Unable to connect to {}", socket_path.display()))?;
    stream
        .write_all(&[STREAM_REQUEST])
        .wrap_err("Unable to request memlogd streaming")?;
    // The timeout applies to every read below, which refreshes the deadline
    // on each record.
    stream
        .set_read_timeout(Some(READ_TIMEOUT))
        .wrap_err("Unable to set read timeout")?;

    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => return Err(e).wrap_err("Memstream read error"),
        }
        if buf.is_empty() {
            thread::sleep(IDLE_RETRY);
            continue;
        }

        let record = String::from_utf8_lossy(&buf).into_owned();
        let (entry, is_app) = normalize_record(&record);

        {
            let mut metrics = shared.metrics();
            if is_app {
                metrics.app.num_input_events += 1;
            } else {
                metrics.dev.num_input_events += 1;
            }
        }

        ingress.send(entry).wrap_err("Ingress channel closed")?;
    }
}
