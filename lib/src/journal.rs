//! Thin wrapper for systemd journal logging; these APIs are explicit no-ops
//! when not running under systemd. Used by the worker, whose stdout is not
//! normally attended by a human since it runs as a systemd-path-activated
//! oneshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Set to true if we failed to write to the journal once, so we only print
/// the fallback warning a single time per process.
static EMITTED_JOURNAL_ERROR: AtomicBool = AtomicBool::new(false);

/// Structured write to the systemd journal; a no-op when systemd is not in
/// use (e.g. under a container-exec probe in tests).
pub fn journal_send<K, V>(priority: libsystemd::logging::Priority, msg: &str, vars: impl Iterator<Item = (K, V)>)
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if !libsystemd::daemon::booted() {
        return;
    }
    if let Err(e) = libsystemd::logging::journal_send(priority, msg, vars) {
        if !EMITTED_JOURNAL_ERROR.swap(true, Ordering::SeqCst) {
            eprintln!("failed to write to journal: {e}");
        }
    }
}

/// Plain-message write to the systemd journal.
pub fn journal_print(priority: libsystemd::logging::Priority, msg: &str) {
    let vars: HashMap<&str, &str> = HashMap::new();
    journal_send(priority, msg, vars.into_iter())
}
