//! RFC-3339 UTC timestamp helpers.
//!
//! Every timestamp column in the store is an RFC-3339 UTC string with
//! millisecond precision. Formatting consistently matters: windows are
//! selected with lexicographic range filters, which agree with
//! chronological order only when every writer uses the same shape.

use anyhow::Context;
use chrono::{DateTime, Utc};

/// Parse an RFC-3339 timestamp (any offset) and convert to UTC.
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Whole minutes elapsed from `earlier` to `later` (negative if reversed).
pub fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    later.signed_duration_since(earlier).num_minutes()
}
