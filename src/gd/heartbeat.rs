//! Worker heartbeat file inspection.
//!
//! The worker rewrites a small JSON record at its own interval; only the file's mtime matters here.

use std::path::Path;
use std::time::UNIX_EPOCH;

/// A heartbeat file older than the child's start by more than this belongs to a previous instance.
pub const PREVIOUS_INSTANCE_SLACK_MS: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatReading {
    /// Written by the current child; age in ms.
    Age(u64),
    /// No file yet, or the file predates the current child.
    NotWritten,
    /// Metadata could not be read for some other reason.
    Unreadable,
}

impl HeartbeatReading {
    /// Age as reported to operators: only a heartbeat from the current child has one.
    pub fn reported_age_ms(&self) -> Option<u64> {
        match self {
            HeartbeatReading::Age(a) => Some(*a),
            _ => None,
        }
    }
}

fn mtime_ms(path: &Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let d = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(d.as_millis() as i64)
}

pub fn read(path: &Path, child_started_at_ms: i64, now_ms: i64) -> HeartbeatReading {
    match mtime_ms(path) {
        Ok(m) if m < child_started_at_ms - PREVIOUS_INSTANCE_SLACK_MS => HeartbeatReading::NotWritten,
        Ok(m) => HeartbeatReading::Age(now_ms.saturating_sub(m).max(0) as u64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HeartbeatReading::NotWritten,
        Err(_) => HeartbeatReading::Unreadable,
    }
}

/// Staleness needs both: the child has run for `timeout_ms`, and its heartbeat age exceeds it.
///
/// A child whose heartbeat cannot be seen, missing or unreadable, is aged from its own start time.
pub fn is_stale(reading: HeartbeatReading, child_started_at_ms: i64, now_ms: i64, timeout_ms: u64) -> bool {
    let uptime = now_ms.saturating_sub(child_started_at_ms).max(0) as u64;
    if uptime < timeout_ms {
        return false;
    }
    match reading {
        HeartbeatReading::Age(age) => age > timeout_ms,
        HeartbeatReading::NotWritten | HeartbeatReading::Unreadable => uptime > timeout_ms,
    }
}
