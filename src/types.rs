//! Shared helpers used by both subsystems.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
