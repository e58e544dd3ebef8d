use chrono::{DateTime, SecondsFormat, Utc};

/// Render a UTC instant the way the ledger stores it: `2024-01-01T00:00:00.000Z`.
///
/// Fixed width with a literal `Z`, so lexicographic order equals chronological order.
pub fn format_timestamp_ms(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time truncated to millisecond precision.
pub fn now_timestamp_ms() -> String {
    format_timestamp_ms(Utc::now())
}

/// Pick the later of a proposed timestamp and the last one written.
///
/// Both must be in `format_timestamp_ms` form. Wall clocks step backwards
/// (NTP, VM migration); the ledger never does.
pub fn clamp_monotonic(proposed: String, last: Option<&str>) -> String {
    match last {
        Some(prev) if prev > proposed.as_str() => prev.to_string(),
        _ => proposed,
    }
}
