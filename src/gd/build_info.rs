//! Build metadata stamped by `build.rs`, shown in the boot log line and on the dashboard.

use chrono::{DateTime, Utc};

const UNKNOWN: &str = "unknown";

pub fn build_host() -> &'static str {
    option_env!("GUARDIAN_BUILD_HOST").unwrap_or(UNKNOWN)
}

pub fn build_commit() -> &'static str {
    option_env!("GUARDIAN_BUILD_COMMIT").unwrap_or(UNKNOWN)
}

pub fn build_time_raw() -> &'static str {
    option_env!("GUARDIAN_BUILD_TIME").unwrap_or(UNKNOWN)
}

/// `epoch:<secs>` as a UTC `YYYY-MM-DD HH:MM:SS UTC`. Anything unparsable is shown as is.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("epoch:")
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn banner() -> String {
    format!(
        "guardian {} ({}, built on {} at {}).",
        env!("CARGO_PKG_VERSION"),
        build_commit(),
        build_host(),
        format_build_time(build_time_raw())
    )
}
