//! Timestamp helpers
//!
//! The upstream system is inconsistent about timestamp formats: some
//! endpoints return RFC 3339 with an offset, others a naive local-looking
//! string that is in fact UTC. Everything is normalised to `DateTime<Utc>`.

use crate::error::{CommonError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Parse an upstream timestamp, treating naive values as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = trimmed.trim_end_matches('Z');
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(naive, format) {
            return Ok(parsed.and_utc());
        }
    }

    Err(CommonError::InvalidTimestamp {
        value: value.to_string(),
    })
}

/// Parse a calendar date (`YYYY-MM-DD`), also accepting a full timestamp.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    parse_timestamp(trimmed).map(|ts| ts.date_naive())
}

/// Format used by the source API for window parameters.
pub fn format_api_timestamp(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Format used in canonical records.
pub fn format_canonical(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}
