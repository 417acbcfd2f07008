use chrono::{Local, NaiveDateTime, TimeZone};
use tracing::warn;

// The producer emits local datetimes either as plain seconds or with a
// fractional part. Both grammars are tried before giving up.
const CANONICAL: &str = "%Y-%m-%dT%H:%M:%S";
const WITH_FRACTION: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Parse an event timestamp, substituting ingestion wall-clock time for
/// absent or malformed values. By contract this never rejects a record.
pub fn parse_event_timestamp(raw: Option<&str>) -> NaiveDateTime {
    let Some(raw) = raw else {
        return Local::now().naive_local();
    };

    NaiveDateTime::parse_from_str(raw, CANONICAL)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, WITH_FRACTION))
        .unwrap_or_else(|error| {
            warn!(
                timestamp = raw,
                %error,
                "error parsing timestamp, using current time"
            );
            Local::now().naive_local()
        })
}

/// Interpret a parsed local datetime in the system zone and return the
/// corresponding epoch instant in milliseconds, as stored by the document
/// store. DST gaps fall back to a UTC interpretation.
pub fn to_epoch_millis(timestamp: NaiveDateTime) -> i64 {
    match Local.from_local_datetime(&timestamp).earliest() {
        Some(local) => local.timestamp_millis(),
        None => timestamp.and_utc().timestamp_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_canonical_local_datetime() {
        let ts = parse_event_timestamp(Some("2024-01-01T00:00:00"));
        assert_eq!(ts.year(), 2024);
        assert_eq!(ts.month(), 1);
        assert_eq!(ts.hour(), 0);
    }

    #[test]
    fn parses_iso_with_fraction() {
        let ts = parse_event_timestamp(Some("2024-06-15T13:45:30.123456"));
        assert_eq!(ts.second(), 30);
        assert_eq!(ts.and_utc().timestamp_subsec_millis(), 123);
    }

    #[test]
    fn malformed_timestamp_substitutes_now() {
        let before = Local::now().naive_local();
        let ts = parse_event_timestamp(Some("not-a-timestamp"));
        let after = Local::now().naive_local();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn absent_timestamp_substitutes_now() {
        let before = Local::now().naive_local();
        let ts = parse_event_timestamp(None);
        let after = Local::now().naive_local();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn epoch_millis_is_stable_for_fixed_input() {
        let ts = parse_event_timestamp(Some("2024-01-01T00:00:00"));
        let a = to_epoch_millis(ts);
        let b = to_epoch_millis(ts);
        assert_eq!(a, b);
    }
}
