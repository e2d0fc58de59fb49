//! Formatted output helpers for CLI commands.
//!
//! Provides colored labels, short hash display, and human-readable
//! percentage, duration and timestamp formatting.

use chrono::{DateTime, Utc};

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const CYAN: &str = "\x1b[36m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

/// Hex characters shown for a checksum in tables.
const SHORT_HASH_LEN: usize = 12;

/// Shortens a hex digest for display.
#[must_use]
pub fn short_hash(hex: &str) -> &str {
    hex.get(..SHORT_HASH_LEN).unwrap_or(hex)
}

/// Formats a coverage ratio (e.g., "12.5%").
#[must_use]
pub fn format_percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Formats a millisecond duration (e.g., "850ms", "12.4s", "3m 05s").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        let secs = ms / 1_000;
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

/// Formats a timestamp for tables.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Joins names on one line, or "-" when there are none.
#[must_use]
pub fn join_names<I, T>(names: I) -> String
where
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    let joined = names
        .into_iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if joined.is_empty() { "-".into() } else { joined }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn short_hash_truncates_digests() {
        assert_eq!(short_hash(&"ab".repeat(32)), "abababababab");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn format_percent_uses_one_decimal() {
        assert_eq!(format_percent(0.125), "12.5%");
        assert_eq!(format_percent(0.0), "0.0%");
    }

    #[test]
    fn format_duration_ms_picks_a_unit() {
        assert_eq!(format_duration_ms(850), "850ms");
        assert_eq!(format_duration_ms(12_400), "12.4s");
        assert_eq!(format_duration_ms(185_000), "3m 05s");
    }

    #[test]
    fn format_timestamp_is_second_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-09 14:05:07");
    }

    #[test]
    fn join_names_handles_empty_input() {
        assert_eq!(join_names(Vec::<String>::new()), "-");
        assert_eq!(join_names(["read", "write"]), "read, write");
    }
}
