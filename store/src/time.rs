use chrono::NaiveDateTime;

/// Format used by SQLite's `STRFTIME('%Y-%m-%d %H:%M:%f', 'NOW')`, which we
/// rely on for sub-second precision log timestamps.
const LOG_TIME_FMT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a log timestamp as persisted by the store.
pub fn parse_log_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, LOG_TIME_FMT).ok()
}

/// `end - start`, in fractional seconds. `chrono`'s `Duration` already
/// carries sub-second precision, so unlike a hand-rolled split-on-'.'
/// the subtraction below falls out directly from the parsed timestamps.
pub fn diff_timestamps(start: &str, end: &str) -> Option<f64> {
    let start = parse_log_time(start)?;
    let end = parse_log_time(end)?;
    Some((end - start).num_microseconds()? as f64 / 1_000_000.0)
}
