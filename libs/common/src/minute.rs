use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Truncates a timestamp to the start of its wall-clock minute.
///
/// Analytics samples are keyed by minute; truncating here keeps the upsert
/// key identical for every flush within the same minute.
pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc only fails for spans > i64::MAX nanos; a minute is fine.
    at.duration_trunc(TimeDelta::minutes(1)).unwrap_or(at)
}
