//! Timestamp helpers.
//!
//! The engine works in epoch milliseconds internally. ISO-8601 strings are
//! accepted at ingestion boundaries and normalized here.

use chrono::{DateTime, TimeZone, Utc};

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds to an ISO-8601/RFC-3339 string (UTC).
#[must_use]
pub fn to_iso(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        _ => Utc.timestamp_millis_opt(0).unwrap().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    }
}

/// Parse an ISO-8601/RFC-3339 timestamp into epoch milliseconds.
#[must_use]
pub fn parse_iso(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}
