//! Timestamp text format: detection, parsing, and formatting.
//!
//! Recognized input formats:
//! - `YYYY-MM-DD`
//! - `YYYY-MM-DD HH:MM:SS`
//! - `YYYY-MM-DD HH:MM:SS.f{1..6}`
//! - any of the above with offset `±HH`, `±HH:MM`, or `±HH:MM:SS` appended
//!
//! Absence of an offset yields local time; presence yields a fixed-offset
//! zone. Fractional seconds are right-padded with zeros to nanosecond
//! precision.

use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike,
};

use crate::error::{Error, Result};

fn decode_err(s: &str) -> Error {
    Error::Decode(format!("invalid timestamp: {:?}", s))
}

fn parse_two_digits(b: &[u8]) -> Option<u32> {
    if b.len() < 2 || !b[0].is_ascii_digit() || !b[1].is_ascii_digit() {
        return None;
    }
    Some(((b[0] - b'0') as u32) * 10 + (b[1] - b'0') as u32)
}

/// Parse the date part `YYYY-MM-DD`.
fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| decode_err(s))
}

/// Parse the time part `HH:MM:SS`.
fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S").map_err(|_| decode_err(s))
}

/// Parse 1-6 fractional-second digits, right-padded to nanoseconds.
fn parse_fraction(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 6 {
        return None;
    }
    let mut nanos: u32 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        nanos = nanos * 10 + (b - b'0') as u32;
    }
    for _ in digits.len()..9 {
        nanos *= 10;
    }
    Some(nanos)
}

/// Parse an offset `±HH`, `±HH:MM`, or `±HH:MM:SS` into signed seconds.
fn parse_offset(s: &[u8]) -> Option<i32> {
    let sign = match s.first()? {
        &b'+' => 1,
        &b'-' => -1,
        _ => return None,
    };
    let rest = &s[1..];

    let hours = parse_two_digits(rest)?;
    let mut seconds = hours * 3600;
    let mut rest = &rest[2..];

    for unit in [60u32, 1] {
        if rest.is_empty() {
            break;
        }
        if rest[0] != b':' {
            return None;
        }
        seconds += parse_two_digits(&rest[1..])? * unit;
        rest = &rest[3..];
    }
    if !rest.is_empty() {
        return None;
    }

    Some(sign * seconds as i32)
}

/// Resolve a wall-clock datetime in the local timezone.
fn local_to_fixed(s: &str, naive: NaiveDateTime) -> Result<DateTime<FixedOffset>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
        .ok_or_else(|| decode_err(s))
}

/// Parse a timestamp in any of the recognized formats.
pub fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>> {
    // Date-only form
    if s.len() == 10 {
        let date = parse_date(s)?;
        let naive = date.and_hms_opt(0, 0, 0).ok_or_else(|| decode_err(s))?;
        return local_to_fixed(s, naive);
    }

    if s.len() < 19 || s.as_bytes()[10] != b' ' {
        return Err(decode_err(s));
    }

    let date = parse_date(&s[..10])?;
    let time = parse_time(&s[11..19])?;
    let mut naive = NaiveDateTime::new(date, time);

    // Optional fraction, then optional offset
    let rest = s[19..].as_bytes();
    let (fraction, offset) = match rest.iter().position(|&b| b == b'+' || b == b'-') {
        Some(pos) => (&rest[..pos], Some(&rest[pos..])),
        None => (rest, None),
    };

    if !fraction.is_empty() {
        if fraction[0] != b'.' {
            return Err(decode_err(s));
        }
        let nanos = parse_fraction(&fraction[1..]).ok_or_else(|| decode_err(s))?;
        naive = naive
            .with_nanosecond(nanos)
            .ok_or_else(|| decode_err(s))?;
    }

    match offset {
        Some(bytes) => {
            let seconds = parse_offset(bytes).ok_or_else(|| decode_err(s))?;
            let zone = FixedOffset::east_opt(seconds).ok_or_else(|| decode_err(s))?;
            zone.from_local_datetime(&naive)
                .single()
                .ok_or_else(|| decode_err(s))
        }
        None => local_to_fixed(s, naive),
    }
}

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS.ffffff+HH:MM`.
pub fn format_timestamp(dt: &DateTime<FixedOffset>, out: &mut String) {
    out.push_str(&dt.format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string());
}

/// Format a naive timestamp as `YYYY-MM-DD HH:MM:SS.ffffff` (no offset).
pub fn format_naive_timestamp(dt: &NaiveDateTime, out: &mut String) {
    out.push_str(&dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string());
}
