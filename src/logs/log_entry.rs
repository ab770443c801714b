// SPDX-License-Identifier: Apache-2.0
use chrono::DateTime;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

/// Split-second timestamp carried by every segment line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// Convert an adapter-supplied RFC3339 string. Adapters always stamp a
    /// parseable time; anything else is rejected hard.
    pub fn from_rfc3339(s: &str) -> Result<Self> {
        let parsed = DateTime::parse_from_rfc3339(s)
            .wrap_err_with(|| format!("Invalid entry timestamp {:?}", s))?;
        Ok(Self {
            seconds: parsed.timestamp(),
            nanos: parsed.timestamp_subsec_nanos() as i32,
        })
    }
}

/// One log event as serialized into a segment, one JSON object per line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub severity: String,
    pub source: String,
    pub content: String,
    /// Originating pid, as a string; empty when unknown.
    pub iid: String,
    pub filename: String,
    /// Globally monotonic, assigned in writer order starting at 1.
    pub msgid: u64,
    pub function: String,
    pub timestamp: Timestamp,
}
