// SPDX-License-Identifier: Apache-2.0
//! Input adapters. Each adapter runs on its own thread, normalizes one wire
//! format into [`InputEntry`] and forwards it on the shared bounded ingress
//! channel. A full channel blocks the adapter; nothing is dropped silently.
pub mod kmsg;
pub mod memstream;
pub mod syslog;

/// Syslog severity names, indexed by `priority % 8`.
pub const PRIORITY_STR: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

/// Map a syslog/kernel priority to its severity name. Negative priorities
/// (missing or malformed on the wire) default to `info`.
pub fn severity_str(priority: i64) -> &'static str {
    if priority < 0 {
        "info"
    } else {
        PRIORITY_STR[(priority % 8) as usize]
    }
}

/// A normalized log event from any adapter, consumed once by the writer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InputEntry {
    pub severity: String,
    pub source: String,
    /// One line of log text.
    pub content: String,
    pub pid: String,
    /// File name that generated the log message.
    pub filename: String,
    /// Function name that generated the log message.
    pub function: String,
    /// RFC3339 with nanoseconds.
    pub timestamp: String,
    /// Set for app container traffic; empty for device traffic.
    pub app_uuid: String,
    /// App container name.
    pub ac_name: String,
    /// App container log time.
    pub ac_log_time: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "emerg")]
    #[case(3, "err")]
    #[case(6, "info")]
    #[case(7, "debug")]
    // Facility bits are folded away modulo 8.
    #[case(30, "info")]
    #[case(165, "notice")]
    #[case(-1, "info")]
    fn priority_to_severity(#[case] priority: i64, #[case] expected: &str) {
        assert_eq!(severity_str(priority), expected);
    }
}
