//! Entry keys for buffered records and live log lines
//!
//! A key is a fixed-width string of digits:
//! `YYYYMMDDHHMMSSuuuuuu` (UTC, microseconds) + 10-digit process id + 6-digit
//! per-process sequence. Because every part is zero-padded, plain string
//! comparison orders keys chronologically.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of the timestamp prefix
pub const TIMESTAMP_WIDTH: usize = 20;

/// Total key length
pub const KEY_WIDTH: usize = TIMESTAMP_WIDTH + 10 + 6;

const SEQUENCE_MODULUS: u64 = 1_000_000;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh key for the current instant
pub fn next_key() -> String {
    key_at(Utc::now())
}

/// Generate a key for the given instant
pub fn key_at(at: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % SEQUENCE_MODULUS;
    format!(
        "{}{:010}{:06}",
        at.format("%Y%m%d%H%M%S%6f"),
        std::process::id(),
        seq
    )
}

/// Render the timestamp part of a key as `YYYY-MM-DD HH:MM:SS.uuuuuu`
pub fn render_timestamp(key: &str) -> Option<String> {
    let ts = key.get(..TIMESTAMP_WIDTH)?;
    if !ts.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{} {}:{}:{}.{}",
        &ts[0..4],
        &ts[4..6],
        &ts[6..8],
        &ts[8..10],
        &ts[10..12],
        &ts[12..14],
        &ts[14..20]
    ))
}
