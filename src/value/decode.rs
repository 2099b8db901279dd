//! Text decoding of result columns into Rust destinations.
//!
//! NULL cells decode to the destination's zero value (`false`, `0`, empty
//! string/collection); wrap the destination in `Option` to observe NULL
//! directly. Numeric overflow of the destination type is a decode error.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

use super::{FromSql, time};

fn cell_str(raw: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(raw)
        .map_err(|e| Error::Decode(format!("invalid UTF-8 in column: {}", e)))
}

impl FromSql for bool {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(false),
            Some(b"t") | Some(b"true") => Ok(true),
            Some(b"f") | Some(b"false") => Ok(false),
            Some(other) => Err(Error::Decode(format!(
                "invalid boolean: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

macro_rules! impl_from_sql_number {
    ($($t:ty => $zero:expr),+ $(,)?) => {$(
        impl FromSql for $t {
            fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
                match raw {
                    None => Ok($zero),
                    Some(bytes) => {
                        let s = cell_str(bytes)?;
                        s.parse().map_err(|e| {
                            Error::Decode(format!(
                                "cannot decode {:?} into {}: {}",
                                s,
                                stringify!($t),
                                e
                            ))
                        })
                    }
                }
            }
        }
    )+};
}

impl_from_sql_number!(
    i8 => 0, i16 => 0, i32 => 0, i64 => 0, isize => 0,
    u8 => 0, u16 => 0, u32 => 0, u64 => 0, usize => 0,
    f32 => 0.0, f64 => 0.0,
);

impl FromSql for String {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(String::new()),
            Some(bytes) => cell_str(bytes).map(str::to_string),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(Vec::new()),
            Some(bytes) => decode_bytea(bytes),
        }
    }
}

/// Decode a `bytea` cell: `\x`-prefixed hex, or the legacy octal-escape form.
pub fn decode_bytea(raw: &[u8]) -> Result<Vec<u8>> {
    if let Some(hex) = raw.strip_prefix(b"\\x") {
        return decode_hex(hex);
    }
    decode_octal_escapes(raw)
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Decode(format!("invalid hex digit: {:?}", b as char))),
    }
}

fn decode_hex(hex: &[u8]) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Decode("odd-length bytea hex string".into()));
    }
    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        out.push((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?);
    }
    Ok(out)
}

fn decode_octal_escapes(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut data = raw;
    while let Some(&b) = data.first() {
        if b != b'\\' {
            out.push(b);
            data = &data[1..];
            continue;
        }
        if data.get(1) == Some(&b'\\') {
            out.push(b'\\');
            data = &data[2..];
            continue;
        }
        if data.len() < 4 {
            return Err(Error::Decode("truncated bytea octal escape".into()));
        }
        let mut value: u16 = 0;
        for &digit in &data[1..4] {
            if !(b'0'..=b'7').contains(&digit) {
                return Err(Error::Decode(format!(
                    "invalid bytea octal escape: {:?}",
                    String::from_utf8_lossy(&data[..4])
                )));
            }
            value = value * 8 + (digit - b'0') as u16;
        }
        if value > 255 {
            return Err(Error::Decode("bytea octal escape out of range".into()));
        }
        out.push(value as u8);
        data = &data[4..];
    }
    Ok(out)
}

/// Parse the PostgreSQL array text form `{e1,e2,…}` into raw elements.
///
/// `None` elements are SQL NULL. Quoted elements may escape `"` and `\`
/// with a backslash.
pub fn parse_array(raw: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let malformed = || Error::Decode(format!("malformed array: {:?}", String::from_utf8_lossy(raw)));

    let inner = raw
        .strip_prefix(b"{")
        .and_then(|r| r.strip_suffix(b"}"))
        .ok_or_else(malformed)?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut elems = Vec::new();
    let mut data = inner;
    loop {
        let elem = if data.first() == Some(&b'"') {
            let mut value = Vec::new();
            let mut i = 1;
            loop {
                match data.get(i) {
                    Some(&b'"') => break,
                    Some(&b'\\') => {
                        value.push(*data.get(i + 1).ok_or_else(malformed)?);
                        i += 2;
                    }
                    Some(&b) => {
                        value.push(b);
                        i += 1;
                    }
                    None => return Err(malformed()),
                }
            }
            data = &data[i + 1..];
            Some(value)
        } else {
            let end = memchr::memchr(b',', data).unwrap_or(data.len());
            let value = &data[..end];
            data = &data[end..];
            if value == b"NULL" {
                None
            } else {
                Some(value.to_vec())
            }
        };
        elems.push(elem);

        match data.first() {
            None => break,
            Some(&b',') => data = &data[1..],
            _ => return Err(malformed()),
        }
    }

    Ok(elems)
}

macro_rules! impl_from_sql_vec {
    ($($t:ty),+) => {$(
        impl FromSql for Vec<$t> {
            fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
                match raw {
                    None => Ok(Vec::new()),
                    Some(bytes) => parse_array(bytes)?
                        .into_iter()
                        .map(|elem| <$t>::from_sql(elem.as_deref()))
                        .collect(),
                }
            }
        }
    )+};
}

impl_from_sql_vec!(String, bool, i16, i32, i64, u32, u64, f32, f64, Option<String>, Option<i64>);

/// Parse the hstore text form `"k"=>"v",…`.
///
/// Escapes inside quotes: `\"`, `\\`, and a doubled `""`. An unquoted NULL
/// value decodes to an empty string.
pub fn parse_hstore(raw: &[u8]) -> Result<Vec<(String, String)>> {
    let malformed =
        || Error::Decode(format!("malformed hstore: {:?}", String::from_utf8_lossy(raw)));

    fn skip_spaces(data: &[u8]) -> &[u8] {
        let n = data.iter().take_while(|&&b| b == b' ').count();
        &data[n..]
    }

    fn parse_quoted(data: &[u8]) -> Option<(String, &[u8])> {
        let mut data = data.strip_prefix(b"\"")?;
        let mut value = Vec::new();
        loop {
            match data.first()? {
                &b'"' => {
                    // Doubled quote is an escaped quote
                    if data.get(1) == Some(&b'"') {
                        value.push(b'"');
                        data = &data[2..];
                    } else {
                        data = &data[1..];
                        break;
                    }
                }
                &b'\\' => {
                    value.push(*data.get(1)?);
                    data = &data[2..];
                }
                &b => {
                    value.push(b);
                    data = &data[1..];
                }
            }
        }
        String::from_utf8(value).ok().map(|s| (s, data))
    }

    let mut pairs = Vec::new();
    let mut data = skip_spaces(raw);
    while !data.is_empty() {
        let (key, rest) = parse_quoted(data).ok_or_else(malformed)?;
        let rest = skip_spaces(rest)
            .strip_prefix(b"=>")
            .ok_or_else(malformed)?;
        let rest = skip_spaces(rest);

        let (value, rest) = if let Some(stripped) = rest.strip_prefix(b"NULL") {
            (String::new(), stripped)
        } else {
            parse_quoted(rest).ok_or_else(malformed)?
        };
        pairs.push((key, value));

        data = skip_spaces(rest);
        if let Some(stripped) = data.strip_prefix(b",") {
            data = skip_spaces(stripped);
        } else if !data.is_empty() {
            return Err(malformed());
        }
    }

    Ok(pairs)
}

impl FromSql for HashMap<String, String> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(HashMap::new()),
            Some(bytes) => Ok(parse_hstore(bytes)?.into_iter().collect()),
        }
    }
}

impl FromSql for serde_json::Value {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(serde_json::Value::Null),
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| Error::Decode(format!("invalid JSON: {}", e))),
        }
    }
}

fn timestamp_cell(raw: Option<&[u8]>, dst: &str) -> Result<DateTime<FixedOffset>> {
    let bytes = raw.ok_or_else(|| {
        Error::Decode(format!("cannot decode NULL into {}; use Option", dst))
    })?;
    time::parse_timestamp(cell_str(bytes)?)
}

impl FromSql for DateTime<FixedOffset> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        timestamp_cell(raw, "DateTime<FixedOffset>")
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        timestamp_cell(raw, "DateTime<Utc>").map(|dt| dt.with_timezone(&Utc))
    }
}

impl FromSql for DateTime<Local> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        timestamp_cell(raw, "DateTime<Local>").map(|dt| dt.with_timezone(&Local))
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        timestamp_cell(raw, "NaiveDateTime").map(|dt| dt.naive_local())
    }
}

impl FromSql for NaiveDate {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        let bytes =
            raw.ok_or_else(|| Error::Decode("cannot decode NULL into NaiveDate; use Option".into()))?;
        let s = cell_str(bytes)?;
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| Error::Decode(format!("invalid date: {:?}", s)))
    }
}
