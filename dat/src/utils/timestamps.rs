//! Timestamp helpers for manifests, file naming and datetime coercion.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Represents a UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Manifest timestamp format: ISO-8601 UTC without sub-second precision.
pub const MANIFEST_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Compact format used in generated file names.
pub const COMPACT_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC time formatted for manifests.
#[must_use]
pub fn manifest_timestamp() -> String {
    format_manifest(&Utc::now())
}

/// Formats a timestamp for manifests (`2024-01-31T12:00:00Z`).
#[must_use]
pub fn format_manifest(dt: &Timestamp) -> String {
    dt.format(MANIFEST_FORMAT).to_string()
}

/// Formats a timestamp for file names (`20240131T120000Z`).
#[must_use]
pub fn format_compact(dt: &Timestamp) -> String {
    dt.format(COMPACT_FORMAT).to_string()
}

/// Parses a datetime using an explicit `strftime` format, or by trying
/// Unix seconds, RFC 3339 and a list of common layouts when none is given.
pub fn parse_datetime(input: &str, format: Option<&str>) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Some(fmt) = format {
        return parse_with_format(trimmed, fmt)
            .ok_or_else(|| TimestampError::InvalidFormat(trimmed.to_string()));
    }

    if let Ok(secs) = trimmed.parse::<i64>() {
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| TimestampError::InvalidFormat(trimmed.to_string()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y",
        "%d %b %Y",
    ];

    formats
        .iter()
        .find_map(|fmt| parse_with_format(trimmed, fmt))
        .ok_or_else(|| TimestampError::InvalidFormat(trimmed.to_string()))
}

fn parse_with_format(s: &str, fmt: &str) -> Option<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(s, fmt)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_manifest_timestamp_has_no_subseconds() {
        let ts = manifest_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert!(!ts.contains('.'));
    }

    #[test]
    fn test_format_compact() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 31, 12, 5, 9).unwrap();
        assert_eq!(format_compact(&dt), "20240131T120509Z");
        assert_eq!(format_manifest(&dt), "2024-01-31T12:05:09Z");
    }

    #[test]
    fn test_parse_datetime_guesses_layout() {
        let dt = parse_datetime("2023-10-05 14:30:00", None).unwrap();
        assert_eq!(dt.year(), 2023);
        assert_eq!(dt.day(), 5);

        let dt = parse_datetime("2023-10-05T14:30:00Z", None).unwrap();
        assert_eq!(dt.month(), 10);
    }

    #[test]
    fn test_parse_datetime_explicit_format() {
        let dt = parse_datetime("05.10.2023", Some("%d.%m.%Y")).unwrap();
        assert_eq!(dt.month(), 10);
        assert!(parse_datetime("2023-10-05", Some("%d.%m.%Y")).is_err());
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(matches!(parse_datetime("  ", None), Err(TimestampError::EmptyString)));
    }
}
