//! The value codec: runtime value universe, parameter encoding, and typed
//! destination loading.

pub mod decode;
pub mod encode;
pub mod interpolate;
pub mod time;

pub use interpolate::interpolate;

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Runtime value universe for query parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<FixedOffset>),
    /// Ordered sequence, encoded as `ARRAY[…]`
    Array(Vec<Value>),
    /// Text-to-text mapping, encoded as an hstore literal
    Hstore(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// Trait for encoding a Rust value as a query parameter.
///
/// `to_value` produces a primitive [`Value`] that is re-dispatched through
/// the standard encoder. Types with their own SQL literal syntax can
/// override [`ToSql::append_literal`]; its output is trusted as a complete,
/// already-quoted literal and spliced into the query verbatim.
pub trait ToSql {
    /// Produce the primitive value to encode.
    fn to_value(&self) -> Result<Value>;

    /// Append this value as a quoted SQL literal (used by placeholder
    /// interpolation).
    fn append_literal(&self, out: &mut String) -> Result<()> {
        encode::append_literal(&self.to_value()?, out)
    }

    /// The bare text-format wire value (used by Bind); `None` is NULL.
    fn to_text(&self) -> Result<Option<String>> {
        encode::to_text(&self.to_value()?)
    }
}

impl ToSql for Value {
    fn to_value(&self) -> Result<Value> {
        Ok(self.clone())
    }
}

impl<T: ToSql + ?Sized> ToSql for &T {
    fn to_value(&self) -> Result<Value> {
        (*self).to_value()
    }

    fn append_literal(&self, out: &mut String) -> Result<()> {
        (*self).append_literal(out)
    }

    fn to_text(&self) -> Result<Option<String>> {
        (*self).to_text()
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_value(&self) -> Result<Value> {
        match self {
            Some(inner) => inner.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn append_literal(&self, out: &mut String) -> Result<()> {
        match self {
            Some(inner) => inner.append_literal(out),
            None => {
                out.push_str("NULL");
                Ok(())
            }
        }
    }

    fn to_text(&self) -> Result<Option<String>> {
        match self {
            Some(inner) => inner.to_text(),
            None => Ok(None),
        }
    }
}

impl ToSql for bool {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bool(*self))
    }
}

macro_rules! impl_to_sql_int {
    ($($t:ty),+) => {$(
        impl ToSql for $t {
            fn to_value(&self) -> Result<Value> {
                Ok(Value::Int(*self as i64))
            }
        }
    )+};
}

impl_to_sql_int!(i8, i16, i32, i64, isize);

macro_rules! impl_to_sql_uint {
    ($($t:ty),+) => {$(
        impl ToSql for $t {
            fn to_value(&self) -> Result<Value> {
                Ok(Value::UInt(*self as u64))
            }
        }
    )+};
}

impl_to_sql_uint!(u8, u16, u32, u64, usize);

impl ToSql for f32 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Float(*self as f64))
    }

    // Format at f32 precision so the shortest round-trippable form is kept.
    fn append_literal(&self, out: &mut String) -> Result<()> {
        encode::append_f32_literal(*self, out);
        Ok(())
    }

    fn to_text(&self) -> Result<Option<String>> {
        let mut s = String::new();
        encode::push_f32(&mut s, *self);
        Ok(Some(s))
    }
}

impl ToSql for f64 {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Float(*self))
    }
}

impl ToSql for str {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.to_string()))
    }
}

impl ToSql for String {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.clone()))
    }
}

impl ToSql for [u8] {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bytes(self.to_vec()))
    }
}

impl ToSql for Vec<u8> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Bytes(self.clone()))
    }
}

macro_rules! impl_to_sql_vec {
    ($($t:ty),+) => {$(
        impl ToSql for Vec<$t> {
            fn to_value(&self) -> Result<Value> {
                let elems: Result<Vec<Value>> = self.iter().map(|v| v.to_value()).collect();
                Ok(Value::Array(elems?))
            }
        }
    )+};
}

impl_to_sql_vec!(String, i16, i32, i64, f64);

impl ToSql for Vec<&str> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Array(
            self.iter().map(|s| Value::Text(s.to_string())).collect(),
        ))
    }
}

impl ToSql for HashMap<String, String> {
    fn to_value(&self) -> Result<Value> {
        let mut pairs: Vec<(String, String)> = self
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Deterministic output regardless of hash order
        pairs.sort();
        Ok(Value::Hstore(pairs))
    }
}

impl ToSql for DateTime<FixedOffset> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Timestamp(*self))
    }
}

impl ToSql for DateTime<Utc> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Timestamp(self.fixed_offset()))
    }
}

impl ToSql for DateTime<Local> {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Timestamp(self.fixed_offset()))
    }
}

impl ToSql for NaiveDateTime {
    // No timezone attached, so the wire form carries no offset.
    fn to_value(&self) -> Result<Value> {
        let mut s = String::new();
        time::format_naive_timestamp(self, &mut s);
        Ok(Value::Text(s))
    }
}

impl ToSql for NaiveDate {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Text(self.format("%Y-%m-%d").to_string()))
    }
}

impl ToSql for serde_json::Value {
    fn to_value(&self) -> Result<Value> {
        Ok(Value::Json(self.clone()))
    }
}

/// Wrapper encoding/decoding any serde type as PostgreSQL `json`/`jsonb`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Json<T>(pub T);

impl<T: Serialize> ToSql for Json<T> {
    fn to_value(&self) -> Result<Value> {
        let json = serde_json::to_value(&self.0)
            .map_err(|e| Error::Encode(format!("JSON serialization failed: {}", e)))?;
        Ok(Value::Json(json))
    }
}

impl<T: DeserializeOwned> FromSql for Json<T> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        let bytes = raw.ok_or_else(|| Error::Decode("cannot decode NULL into Json".into()))?;
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|e| Error::Decode(format!("invalid JSON: {}", e)))
    }
}

/// `bigint[]` helper, mirrors `Strings`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ints(pub Vec<i64>);

impl ToSql for Ints {
    fn to_value(&self) -> Result<Value> {
        self.0.to_value()
    }
}

impl FromSql for Ints {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        Vec::<i64>::from_sql(raw).map(Ints)
    }
}

/// `text[]` helper, mirrors `Ints`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Strings(pub Vec<String>);

impl ToSql for Strings {
    fn to_value(&self) -> Result<Value> {
        self.0.to_value()
    }
}

impl FromSql for Strings {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        Vec::<String>::from_sql(raw).map(Strings)
    }
}

/// Trait for decoding one text-format column into a Rust value.
///
/// `raw` is `None` for SQL NULL; scalar implementations decode NULL to
/// their zero value, `Option<T>` decodes it to `None`.
pub trait FromSql: Sized {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self>;
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(raw: Option<&[u8]>) -> Result<Self> {
        match raw {
            None => Ok(None),
            Some(_) => T::from_sql(raw).map(Some),
        }
    }
}

/// A per-row destination populated column by column.
pub trait Loader {
    /// Called once per column; `raw` is `None` for SQL NULL.
    fn load(&mut self, col_idx: usize, col_name: &str, raw: Option<&[u8]>) -> Result<()>;
}

/// A destination for a whole result set: hands out one per-row destination
/// before each row is loaded. Single-row destinations return themselves.
pub trait Collection {
    fn begin_row(&mut self) -> &mut dyn Loader;
}

/// Loads the first column of each row into a single destination.
///
/// Constructed by [`load_into`].
pub struct LoadInto<'a, T: FromSql> {
    dst: &'a mut T,
}

/// Create a [`Loader`] that decodes the first column into `dst`.
pub fn load_into<T: FromSql>(dst: &mut T) -> LoadInto<'_, T> {
    LoadInto { dst }
}

impl<T: FromSql> Loader for LoadInto<'_, T> {
    fn load(&mut self, col_idx: usize, col_name: &str, raw: Option<&[u8]>) -> Result<()> {
        if col_idx > 0 {
            return Err(Error::Decode(format!(
                "load_into expects a single column, got extra column {:?}",
                col_name
            )));
        }
        *self.dst = T::from_sql(raw)?;
        Ok(())
    }
}

impl<T: FromSql> Collection for LoadInto<'_, T> {
    fn begin_row(&mut self) -> &mut dyn Loader {
        self
    }
}

/// A destination that ignores all rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl Loader for Discard {
    fn load(&mut self, _col_idx: usize, _col_name: &str, _raw: Option<&[u8]>) -> Result<()> {
        Ok(())
    }
}

impl Collection for Discard {
    fn begin_row(&mut self) -> &mut dyn Loader {
        self
    }
}

macro_rules! impl_loader_tuple {
    ($count:literal: $($idx:tt => $T:ident),+) => {
        impl<$($T: FromSql),+> Loader for ($($T,)+) {
            fn load(&mut self, col_idx: usize, col_name: &str, raw: Option<&[u8]>) -> Result<()> {
                match col_idx {
                    $($idx => self.$idx = $T::from_sql(raw)?,)+
                    _ => {
                        return Err(Error::Decode(format!(
                            "tuple of {} has no field for column {} ({:?})",
                            $count, col_idx, col_name
                        )))
                    }
                }
                Ok(())
            }
        }

        impl<$($T: FromSql),+> Collection for ($($T,)+) {
            fn begin_row(&mut self) -> &mut dyn Loader {
                self
            }
        }
    };
}

impl_loader_tuple!(1: 0 => T0);
impl_loader_tuple!(2: 0 => T0, 1 => T1);
impl_loader_tuple!(3: 0 => T0, 1 => T1, 2 => T2);
impl_loader_tuple!(4: 0 => T0, 1 => T1, 2 => T2, 3 => T3);
impl_loader_tuple!(5: 0 => T0, 1 => T1, 2 => T2, 3 => T3, 4 => T4);
impl_loader_tuple!(6: 0 => T0, 1 => T1, 2 => T2, 3 => T3, 4 => T4, 5 => T5);
impl_loader_tuple!(7: 0 => T0, 1 => T1, 2 => T2, 3 => T3, 4 => T4, 5 => T5, 6 => T6);
impl_loader_tuple!(8: 0 => T0, 1 => T1, 2 => T2, 3 => T3, 4 => T4, 5 => T5, 6 => T6, 7 => T7);

/// Multi-row collection: a fresh `R` is appended for every row.
impl<R: Loader + Default> Collection for Vec<R> {
    fn begin_row(&mut self) -> &mut dyn Loader {
        self.push(R::default());
        self.last_mut().expect("just pushed")
    }
}
