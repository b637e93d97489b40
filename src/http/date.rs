//! HTTP-date helpers: `Wkd, DD Mon YYYY HH:MM:SS GMT`, English abbreviations,
//! UTC, zero-padded fields. Used for `Date`, `Last-Modified`,
//! `If-Modified-Since` and `Expires` handling on both halves of the engine.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Formats an epoch-seconds timestamp as an RFC 7231 IMF-fixdate.
///
/// A negative time means "now".
pub fn format_http_date(time: i64) -> String {
    let t = if time < 0 {
        SystemTime::now()
    } else {
        UNIX_EPOCH + Duration::from_secs(time as u64)
    };
    httpdate::fmt_http_date(t)
}

/// Parses an HTTP-date into epoch seconds. Returns `None` for anything
/// `httpdate` rejects or for dates before the epoch.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let t = httpdate::parse_http_date(value.trim()).ok()?;
    let d = t.duration_since(UNIX_EPOCH).ok()?;
    Some(d.as_secs() as i64)
}

/// Current time in epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
