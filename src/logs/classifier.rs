// SPDX-License-Identifier: Apache-2.0
//! Decide, per entry, whether it belongs to the device stream or to an
//! application tenant, and detect the watchdog going-down message.
use std::collections::HashMap;

use serde_json::json;

use crate::control::AppDomain;
use crate::inputs::InputEntry;

const GUEST_VM_PREFIX: &str = "guest_vm-";
const GUEST_VM_ERR_PREFIX: &str = "guest_vm_err-";

const WATCHDOG_SOURCE_PREFIX: &str = "watchdog";
const WATCHDOG_TIMEOUT_MARKER: &str = "Retry timed-out at";

/// Classify an entry; returns the app uuid or None for device traffic.
///
/// Container entries carry an explicit uuid and get their content wrapped
/// with the container name and log time. Guest VM entries are recognized by
/// their source prefix; the source is rewritten to the bare domain name and
/// resolved through the domain map - an unknown domain falls back to the
/// device stream (with the source already rewritten).
pub fn classify(entry: &mut InputEntry, domains: &HashMap<String, AppDomain>) -> Option<String> {
    if !entry.app_uuid.is_empty() {
        entry.content = format!(
            "{{\"container\":{},\"time\":{},\"msg\":{}}}",
            json!(entry.ac_name),
            json!(entry.ac_log_time),
            json!(entry.content)
        );
        return Some(entry.app_uuid.clone());
    }

    let domain = entry
        .source
        .strip_prefix(GUEST_VM_PREFIX)
        .or_else(|| entry.source.strip_prefix(GUEST_VM_ERR_PREFIX))?;
    if domain.is_empty() {
        return None;
    }
    entry.source = domain.to_string();
    domains.get(&entry.source).map(|d| d.app_uuid.clone())
}

/// True for the watchdog message announcing an imminent shutdown. The writer
/// reacts by forcing severity `emerg` and syncing every line for a while.
pub fn is_watchdog_imminent(entry: &InputEntry) -> bool {
    entry.source.starts_with(WATCHDOG_SOURCE_PREFIX)
        && entry.content.contains(WATCHDOG_TIMEOUT_MARKER)
}
