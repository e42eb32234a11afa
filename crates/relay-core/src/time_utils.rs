use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::debug;

use crate::error::{RelayError, Result};

/// Layout of day-partitioned event directories.
pub const DAY_DIR_FORMAT: &str = "%Y-%m-%d";

/// Naive patterns the forwarder uses when it encodes a time in an event id
/// (`:` is not filename-safe everywhere, so it writes `.` instead).
const EVENT_ID_FORMATS: &[&str] = &["%Y-%m-%dT%H.%M.%S%.3f", "%Y-%m-%dT%H.%M.%S"];

/// Parse a stored timestamp field.
///
/// * JSON string → RFC 3339 (with or without fractional seconds) or a naive
///   `YYYY-MM-DD[T ]HH:MM:SS` interpreted as UTC.
/// * JSON number → Unix seconds; values above 10^12 are treated as millis.
pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                if secs.abs() > 1_000_000_000_000 {
                    DateTime::from_timestamp_millis(secs)
                } else {
                    DateTime::from_timestamp(secs, 0)
                }
            } else {
                let f = n.as_f64()?;
                let secs = f.trunc() as i64;
                let nanos = (f.fract() * 1_000_000_000.0).round() as u32;
                DateTime::from_timestamp(secs, nanos)
            }
        }
        _ => None,
    }
}

/// Parse a timestamp string; `None` for empty or unrecognised input.
pub fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    debug!("could not parse timestamp string \"{}\"", s);
    None
}

/// Recover the receive time from an event id, if the id encodes one.
pub fn parse_event_id_timestamp(event_id: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(event_id) {
        return Some(dt.with_timezone(&Utc));
    }
    EVENT_ID_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(event_id, fmt)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Parse a `YYYY-MM-DD` day-partition directory name.
pub fn parse_day_dir(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, DAY_DIR_FORMAT).ok()
}

/// Parse a caller-supplied `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DAY_DIR_FORMAT)
        .map_err(|_| RelayError::TimestampParse(format!("expected YYYY-MM-DD, got {s:?}")))
}

/// Wall-clock prefix used on captured process output lines.
pub fn format_log_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_rfc3339_variants() {
        let a = parse_timestamp_str("2024-03-01T10:20:30Z").unwrap();
        assert_eq!((a.hour(), a.minute(), a.second()), (10, 20, 30));

        let b = parse_timestamp_str("2024-03-01T12:20:30+02:00").unwrap();
        assert_eq!(a, b);

        let c = parse_timestamp_str("2024-03-01T10:20:30.250Z").unwrap();
        assert_eq!(c.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_parse_naive_as_utc() {
        let dt = parse_timestamp_str("2024-03-01 10:20:30").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-01T10:20:30+00:00");
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(parse_timestamp_str("").is_none());
        assert!(parse_timestamp_str("   ").is_none());
        assert!(parse_timestamp_str("yesterday").is_none());
    }

    #[test]
    fn test_parse_value_numbers() {
        let secs = parse_timestamp_value(&serde_json::json!(1_700_000_000)).unwrap();
        let millis = parse_timestamp_value(&serde_json::json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(secs, millis);
        assert!(parse_timestamp_value(&Value::Null).is_none());
        assert!(parse_timestamp_value(&serde_json::json!([1])).is_none());
    }

    #[test]
    fn test_parse_event_id_formats() {
        let dotted = parse_event_id_timestamp("2024-05-06T07.08.09.123").unwrap();
        assert_eq!((dotted.hour(), dotted.minute(), dotted.second()), (7, 8, 9));
        assert_eq!(dotted.timestamp_subsec_millis(), 123);

        let plain = parse_event_id_timestamp("2024-05-06T07.08.09").unwrap();
        assert_eq!(plain.second(), 9);

        let rfc = parse_event_id_timestamp("2024-05-06T07:08:09Z").unwrap();
        assert_eq!(rfc.day(), 6);

        assert!(parse_event_id_timestamp("a1b2c3-uuid").is_none());
    }

    #[test]
    fn test_parse_day_dir() {
        let d = parse_day_dir("2024-02-29").unwrap();
        assert_eq!((d.year(), d.month(), d.day()), (2024, 2, 29));
        assert!(parse_day_dir("2023-02-29").is_none());
        assert!(parse_day_dir("latest").is_none());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date(" 2024-07-01 ").unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
        );
        let err = parse_date("../../etc").unwrap_err();
        assert!(matches!(err, RelayError::TimestampParse(_)));
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }

    #[test]
    fn test_format_log_time() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_log_time(dt), "2024-01-02 03:04:05");
    }
}
