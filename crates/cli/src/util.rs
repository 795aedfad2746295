//! Shared formatting helpers for CLI output

use chrono::{DateTime, Utc};

/// Current time as fractional Unix seconds
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Format Unix seconds as "2024-01-03 14:30:00 UTC"
pub fn format_timestamp(timestamp: f64) -> String {
    let secs = timestamp.floor() as i64;
    let nanos = ((timestamp - timestamp.floor()) * 1e9) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("{timestamp}"),
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// First 12 hex digits of a checksum, keeping the compression marker
pub fn short_checksum(checksum: &str) -> String {
    let marker = if checksum.ends_with('z') { "z" } else { "" };
    let hex = checksum.trim_end_matches('z');
    format!("{}{}", &hex[..hex.len().min(12)], marker)
}
