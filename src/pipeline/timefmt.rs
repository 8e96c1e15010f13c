//! Bit-exact timestamp text used in every file name and bucket directory.
//!
//! File names carry `YYYY-MM-DDTHHMMSSZ` (UTC, zero padded, literal `T` and
//! `Z`). Hour buckets are rendered as `YYYY-MM-DD/HH`.

use crate::error::AggregatorError;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};

pub const SECS_PER_HOUR: i64 = 3600;
/// 9999-12-31T23:59:59Z, the last instant with a four digit year.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799;
const TIMESTAMP_LEN: usize = 18;
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%SZ";

pub fn is_representable(ts: i64) -> bool {
    (0..=MAX_TIMESTAMP).contains(&ts)
}

fn utc(ts: i64) -> Result<DateTime<Utc>> {
    if !is_representable(ts) {
        return Err(AggregatorError::TimestampOutOfRange(ts).into());
    }
    DateTime::from_timestamp(ts, 0).ok_or_else(|| AggregatorError::TimestampOutOfRange(ts).into())
}

pub fn format_timestamp(ts: i64) -> Result<String> {
    Ok(utc(ts)?.format(TIMESTAMP_FORMAT).to_string())
}

fn digits_at(bytes: &[u8], range: std::ops::Range<usize>) -> bool {
    bytes[range].iter().all(u8::is_ascii_digit)
}

pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let bytes = raw.as_bytes();
    if bytes.len() != TIMESTAMP_LEN {
        return None;
    }
    let shape_ok = digits_at(bytes, 0..4)
        && bytes[4] == b'-'
        && digits_at(bytes, 5..7)
        && bytes[7] == b'-'
        && digits_at(bytes, 8..10)
        && bytes[10] == b'T'
        && digits_at(bytes, 11..17)
        && bytes[17] == b'Z';
    if !shape_ok {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc().timestamp())
        .filter(|ts| is_representable(*ts))
}

pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECS_PER_HOUR)
}

/// Last second that still belongs to the hour bucket containing `ts`.
pub fn hour_close(ts: i64) -> i64 {
    hour_start(ts) + SECS_PER_HOUR - 1
}

pub fn date_part(ts: i64) -> Result<String> {
    Ok(utc(ts)?.format("%Y-%m-%d").to_string())
}

pub fn hour_part(ts: i64) -> Result<String> {
    Ok(utc(ts)?.format("%H").to_string())
}

/// `YYYY-MM-DDTHH`, the hour label embedded in compressed archive names.
pub fn hour_label(ts: i64) -> Result<String> {
    Ok(utc(ts)?.format("%Y-%m-%dT%H").to_string())
}

pub fn parse_hour_label(raw: &str) -> Option<i64> {
    if raw.len() != 13 {
        return None;
    }
    let (date, hour) = raw.split_once('T')?;
    parse_hour_dir(date, hour)
}

pub fn parse_hour_dir(date: &str, hour: &str) -> Option<i64> {
    if date.len() != 10 || hour.len() != 2 {
        return None;
    }
    parse_timestamp(&format!("{date}T{hour}0000Z"))
}

/// Log line stamp, `YYYY/MM/DD HH:MM:SS`.
pub fn log_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y/%m/%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_instant() {
        assert_eq!(format_timestamp(1515174235).expect("fmt"), "2018-01-05T174355Z");
        assert_eq!(format_timestamp(0).expect("fmt"), "1970-01-01T000000Z");
        assert_eq!(
            format_timestamp(MAX_TIMESTAMP).expect("fmt"),
            "9999-12-31T235959Z"
        );
    }

    #[test]
    fn refuses_instants_without_a_four_digit_year() {
        // a feed reporting milliseconds instead of seconds
        let millis = 1_515_171_610_000;
        assert!(!is_representable(millis));
        for ts in [MAX_TIMESTAMP + 1, millis, i64::MAX, -1, i64::MIN] {
            let err = format_timestamp(ts).expect_err("out of range");
            assert!(matches!(
                err.downcast_ref::<AggregatorError>(),
                Some(AggregatorError::TimestampOutOfRange(v)) if *v == ts
            ));
            assert!(date_part(ts).is_err());
            assert!(hour_label(ts).is_err());
        }
    }

    #[test]
    fn parses_what_it_formats() {
        assert_eq!(parse_timestamp("2018-01-05T174355Z"), Some(1515174235));
        assert_eq!(
            parse_timestamp(&format_timestamp(1700000000).expect("fmt")),
            Some(1700000000)
        );
    }

    #[test]
    fn rejects_malformed_text() {
        assert_eq!(parse_timestamp("2018-1-05T174355Z"), None);
        assert_eq!(parse_timestamp("2018-01-05T174355"), None);
        assert_eq!(parse_timestamp("2018-01-05 174355Z"), None);
        assert_eq!(parse_timestamp("2018-13-05T174355Z"), None);
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("1969-12-31T235959Z"), None);
    }

    #[test]
    fn hour_helpers_bucket_by_clock_hour() {
        let ts = 1515174235;
        assert_eq!(hour_start(ts), 1515171600);
        assert_eq!(hour_close(ts), 1515175199);
        assert_eq!(date_part(ts).expect("date"), "2018-01-05");
        assert_eq!(hour_part(ts).expect("hour"), "17");
        assert_eq!(hour_label(ts).expect("label"), "2018-01-05T17");
        assert_eq!(parse_hour_label("2018-01-05T17"), Some(1515171600));
        assert_eq!(parse_hour_dir("2018-01-05", "17"), Some(1515171600));
        assert_eq!(parse_hour_dir("2018-01-05", "7"), None);
    }
}
