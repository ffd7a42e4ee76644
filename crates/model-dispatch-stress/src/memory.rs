//! Resident-set readings from `/proc/self/status`, in KiB.
//!
//! Platforms without procfs report 0.

use std::fs;

const STATUS_PATH: &str = "/proc/self/status";

/// Current resident set size (`VmRSS`).
#[must_use]
pub fn current_rss_kib() -> u64 {
    read_status_field("VmRSS:")
}

/// Peak resident set size since process start (`VmHWM`).
#[must_use]
pub fn peak_rss_kib() -> u64 {
    read_status_field("VmHWM:")
}

fn read_status_field(prefix: &str) -> u64 {
    fs::read_to_string(STATUS_PATH)
        .ok()
        .and_then(|text| parse_status_field(&text, prefix))
        .unwrap_or(0)
}

fn parse_status_field(text: &str, prefix: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(prefix))
        .and_then(parse_status_number)
}

fn parse_status_number(input: &str) -> Option<u64> {
    input
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u64>().ok())
}
