//! SQL placeholder interpolation.
//!
//! Substitutes `?` (positional) and `$N` (1-based index) placeholders with
//! quoted SQL literals. Both dialects may appear in the same query.
//! Substitution never descends into string literals (`'…'` with `''`
//! escape), quoted identifiers (`"…"`), dollar-quoted strings
//! (`$tag$…$tag$`), or line/block comments.

use crate::error::{Error, Result};

use super::ToSql;

/// Substitute placeholders in `query` with `params` rendered as literals.
///
/// With no parameters the query is passed through untouched, `?` and all.
pub fn interpolate(query: &str, params: &[&dyn ToSql]) -> Result<String> {
    if params.is_empty() {
        return Ok(query.to_string());
    }

    let bytes = query.as_bytes();
    let mut out = String::with_capacity(query.len() + params.len() * 8);
    let mut next_positional = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = copy_string_literal(query, i, &mut out)?,
            b'"' => i = copy_quoted_ident(query, i, &mut out)?,
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = copy_line_comment(query, i, &mut out),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = copy_block_comment(query, i, &mut out)?,
            b'?' => {
                let param = params.get(next_positional).ok_or_else(|| {
                    Error::Encode(format!(
                        "expected at least {} parameters, got {}",
                        next_positional + 1,
                        params.len()
                    ))
                })?;
                param.append_literal(&mut out)?;
                next_positional += 1;
                i += 1;
            }
            b'$' => i = substitute_dollar(query, i, params, &mut out)?,
            _ => {
                let ch = query[i..].chars().next().expect("in-bounds char");
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    Ok(out)
}

/// Copy a `'…'` literal (with `''` escape) starting at `start`.
fn copy_string_literal(query: &str, start: usize, out: &mut String) -> Result<usize> {
    let bytes = query.as_bytes();
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            Some(&b'\'') => {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                } else {
                    i += 1;
                    break;
                }
            }
            Some(_) => i += 1,
            None => {
                return Err(Error::Encode("unterminated string literal".into()));
            }
        }
    }
    out.push_str(&query[start..i]);
    Ok(i)
}

/// Copy a `"…"` identifier (with `""` escape) starting at `start`.
fn copy_quoted_ident(query: &str, start: usize, out: &mut String) -> Result<usize> {
    let bytes = query.as_bytes();
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            Some(&b'"') => {
                if bytes.get(i + 1) == Some(&b'"') {
                    i += 2;
                } else {
                    i += 1;
                    break;
                }
            }
            Some(_) => i += 1,
            None => {
                return Err(Error::Encode("unterminated quoted identifier".into()));
            }
        }
    }
    out.push_str(&query[start..i]);
    Ok(i)
}

/// Copy a `--` comment through the end of line.
fn copy_line_comment(query: &str, start: usize, out: &mut String) -> usize {
    let end = memchr::memchr(b'\n', &query.as_bytes()[start..])
        .map(|pos| start + pos + 1)
        .unwrap_or(query.len());
    out.push_str(&query[start..end]);
    end
}

/// Copy a `/* … */` comment, honoring nesting.
fn copy_block_comment(query: &str, start: usize, out: &mut String) -> Result<usize> {
    let bytes = query.as_bytes();
    let mut depth = 1;
    let mut i = start + 2;
    while depth > 0 {
        if i + 1 >= bytes.len() {
            return Err(Error::Encode("unterminated block comment".into()));
        }
        if bytes[i] == b'/' && bytes[i + 1] == b'*' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            depth -= 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    out.push_str(&query[start..i]);
    Ok(i)
}

/// Handle `$`: an index placeholder, a dollar-quoted string, or a bare `$`.
fn substitute_dollar(
    query: &str,
    start: usize,
    params: &[&dyn ToSql],
    out: &mut String,
) -> Result<usize> {
    let bytes = query.as_bytes();

    // $N placeholder
    if bytes.get(start + 1).is_some_and(u8::is_ascii_digit) {
        let digits_end = start
            + 1
            + bytes[start + 1..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
        let index: usize = query[start + 1..digits_end]
            .parse()
            .map_err(|_| Error::Encode("placeholder index out of range".into()))?;
        if index == 0 || index > params.len() {
            return Err(Error::Encode(format!(
                "placeholder ${} out of range, got {} parameters",
                index,
                params.len()
            )));
        }
        params[index - 1].append_literal(out)?;
        return Ok(digits_end);
    }

    // $tag$ opener?
    let tag_end = start
        + 1
        + bytes[start + 1..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
            .count();
    if bytes.get(tag_end) == Some(&b'$') {
        let delim = &query[start..tag_end + 1];
        let body_start = tag_end + 1;
        match query[body_start..].find(delim) {
            Some(pos) => {
                let end = body_start + pos + delim.len();
                out.push_str(&query[start..end]);
                return Ok(end);
            }
            None => {
                return Err(Error::Encode("unterminated dollar-quoted string".into()));
            }
        }
    }

    // Bare '$'
    out.push('$');
    Ok(start + 1)
}
