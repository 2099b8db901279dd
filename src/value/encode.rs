//! Text encoding of parameter values.
//!
//! Two forms are produced from the same [`Value`] universe:
//!
//! - **SQL literals** ([`append_literal`]): quoted and escaped so that the
//!   output concatenated with surrounding SQL is always syntactically valid.
//!   Used by placeholder interpolation.
//! - **Bare wire text** ([`to_text`]): the unquoted text-format cell value
//!   sent in Bind messages.

use crate::error::Result;

use super::{Value, time};

/// Append `s` as a single-quoted SQL string literal, doubling any `'`.
pub fn append_quoted(s: &str, out: &mut String) {
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
}

fn push_hex(bytes: &[u8], out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
}

/// Format an f64 in its shortest round-trippable decimal form.
pub fn push_f64(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("NaN");
    } else if v == f64::INFINITY {
        out.push_str("Infinity");
    } else if v == f64::NEG_INFINITY {
        out.push_str("-Infinity");
    } else {
        out.push_str(&v.to_string());
    }
}

/// Format an f32 in its shortest round-trippable decimal form.
pub fn push_f32(out: &mut String, v: f32) {
    if v.is_nan() {
        out.push_str("NaN");
    } else if v == f32::INFINITY {
        out.push_str("Infinity");
    } else if v == f32::NEG_INFINITY {
        out.push_str("-Infinity");
    } else {
        out.push_str(&v.to_string());
    }
}

fn append_f64_literal(v: f64, out: &mut String) {
    // NaN and the infinities are only valid as quoted strings
    if v.is_finite() {
        push_f64(out, v);
    } else {
        let mut s = String::new();
        push_f64(&mut s, v);
        append_quoted(&s, out);
    }
}

/// f32 counterpart of the literal float encoder.
pub fn append_f32_literal(v: f32, out: &mut String) {
    if v.is_finite() {
        push_f32(out, v);
    } else {
        let mut s = String::new();
        push_f32(&mut s, v);
        append_quoted(&s, out);
    }
}

/// Build the bare hstore text form: `"k"=>"v",…` with `\` and `"` escaped.
fn push_hstore(pairs: &[(String, String)], out: &mut String) {
    let mut first = true;
    for (key, value) in pairs {
        if !first {
            out.push(',');
        }
        first = false;
        push_hstore_string(key, out);
        out.push_str("=>");
        push_hstore_string(value, out);
    }
}

fn push_hstore_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Build the bare array text form: `{e1,e2,…}`.
fn push_array_text(elems: &[Value], out: &mut String) -> Result<()> {
    out.push('{');
    let mut first = true;
    for elem in elems {
        if !first {
            out.push(',');
        }
        first = false;
        match elem {
            Value::Null => out.push_str("NULL"),
            Value::Bool(b) => out.push(if *b { 't' } else { 'f' }),
            Value::Int(v) => out.push_str(&v.to_string()),
            Value::UInt(v) => out.push_str(&v.to_string()),
            Value::Float(v) => {
                let mut s = String::new();
                push_f64(&mut s, *v);
                if v.is_finite() {
                    out.push_str(&s);
                } else {
                    push_array_element_string(&s, out);
                }
            }
            Value::Array(inner) => push_array_text(inner, out)?,
            other => {
                let text = to_text(other)?.unwrap_or_default();
                push_array_element_string(&text, out);
            }
        }
    }
    out.push('}');
    Ok(())
}

/// Quote an array element, escaping `\` and `"` with a backslash.
fn push_array_element_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        if ch == '\\' || ch == '"' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Append `value` as a quoted SQL literal.
pub fn append_literal(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(b) => out.push_str(if *b { "TRUE" } else { "FALSE" }),
        Value::Int(v) => out.push_str(&v.to_string()),
        Value::UInt(v) => out.push_str(&v.to_string()),
        Value::Float(v) => append_f64_literal(*v, out),
        Value::Text(s) => append_quoted(s, out),
        Value::Bytes(bytes) => {
            // E-string whose unescaped content is \x<hex>, the bytea hex form
            out.push_str("E'\\\\x");
            push_hex(bytes, out);
            out.push('\'');
        }
        Value::Timestamp(dt) => {
            out.push('\'');
            time::format_timestamp(dt, out);
            out.push('\'');
        }
        Value::Array(elems) => {
            if elems.is_empty() {
                out.push_str("'{}'");
            } else {
                out.push_str("ARRAY[");
                let mut first = true;
                for elem in elems {
                    if !first {
                        out.push(',');
                    }
                    first = false;
                    append_literal(elem, out)?;
                }
                out.push(']');
            }
        }
        Value::Hstore(pairs) => {
            let mut text = String::new();
            push_hstore(pairs, &mut text);
            append_quoted(&text, out);
        }
        Value::Json(json) => {
            append_quoted(&json.to_string(), out);
        }
    }
    Ok(())
}

/// The bare text-format wire value for `value`; `None` is SQL NULL.
pub fn to_text(value: &Value) -> Result<Option<String>> {
    let mut out = String::new();
    match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => out.push(if *b { 't' } else { 'f' }),
        Value::Int(v) => out.push_str(&v.to_string()),
        Value::UInt(v) => out.push_str(&v.to_string()),
        Value::Float(v) => push_f64(&mut out, *v),
        Value::Text(s) => out.push_str(s),
        Value::Bytes(bytes) => {
            out.push_str("\\x");
            push_hex(bytes, &mut out);
        }
        Value::Timestamp(dt) => time::format_timestamp(dt, &mut out),
        Value::Array(elems) => push_array_text(elems, &mut out)?,
        Value::Hstore(pairs) => push_hstore(pairs, &mut out),
        Value::Json(json) => out.push_str(&json.to_string()),
    }
    Ok(Some(out))
}
