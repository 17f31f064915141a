//! Tagged SQL value used for parameters and result cells.
//!
//! Variable-length payloads are owned, so cloning a value always
//! duplicates its text or blob.

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::types::DataType;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    VarChar(String),
    Char(String),
    WVarChar(String),
    WChar(String),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Decimal(i64),
    Numeric(i64),
    Real(f32),
    Double(f64),
    Float(f64),
    /// Microseconds since the Unix epoch, UTC
    Timestamp(i64),
    /// Microseconds since the Unix epoch at midnight UTC
    Date(i64),
    /// Microseconds since midnight
    Time(i64),
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::VarChar(_) => DataType::VarChar,
            Value::Char(_) => DataType::Char,
            Value::WVarChar(_) => DataType::WVarChar,
            Value::WChar(_) => DataType::WChar,
            Value::TinyInt(_) => DataType::TinyInt,
            Value::SmallInt(_) => DataType::SmallInt,
            Value::Integer(_) => DataType::Integer,
            Value::BigInt(_) => DataType::BigInt,
            Value::Decimal(_) => DataType::Decimal,
            Value::Numeric(_) => DataType::Numeric,
            Value::Real(_) => DataType::Real,
            Value::Double(_) => DataType::Double,
            Value::Float(_) => DataType::Float,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Date(_) => DataType::Date,
            Value::Time(_) => DataType::Time,
            Value::Blob(_) => DataType::Blob,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Value::VarChar(s) | Value::Char(s) | Value::WVarChar(s) | Value::WChar(s) => s.len(),
            Value::Blob(b) => b.len(),
            other => other.data_type().fixed_size().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::VarChar(s) | Value::Char(s) | Value::WVarChar(s) | Value::WChar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Integer view of any integral or temporal value
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::TinyInt(v) => Some(v as i64),
            Value::SmallInt(v) => Some(v as i64),
            Value::Integer(v) => Some(v as i64),
            Value::BigInt(v)
            | Value::Decimal(v)
            | Value::Numeric(v)
            | Value::Timestamp(v)
            | Value::Date(v)
            | Value::Time(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Real(v) => Some(v as f64),
            Value::Double(v) | Value::Float(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn timestamp(dt: DateTime<Utc>) -> Self {
        Value::Timestamp(dt.timestamp_micros())
    }

    pub fn date(d: NaiveDate) -> Self {
        let micros = d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_micros())
            .unwrap_or_default();
        Value::Date(micros)
    }

    pub fn time(t: NaiveTime) -> Self {
        let micros = t.num_seconds_from_midnight() as i64 * 1_000_000
            + (t.nanosecond() % 1_000_000_000) as i64 / 1_000;
        Value::Time(micros)
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match *self {
            Value::Timestamp(v) | Value::Date(v) => DateTime::from_timestamp_micros(v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        self.as_datetime().map(|dt| dt.date_naive())
    }

    pub fn as_time(&self) -> Option<NaiveTime> {
        match *self {
            Value::Time(v) => {
                let secs = u32::try_from(v.div_euclid(1_000_000)).ok()?;
                let nanos = (v.rem_euclid(1_000_000) * 1_000) as u32;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            }
            Value::Timestamp(_) => self.as_datetime().map(|dt| dt.time()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::VarChar(s) | Value::Char(s) | Value::WVarChar(s) | Value::WChar(s) => {
                write!(f, "{}", s)
            }
            Value::Real(v) => write!(f, "{}", v),
            Value::Double(v) | Value::Float(v) => write!(f, "{}", v),
            Value::Timestamp(_) | Value::Date(_) => match self.as_datetime() {
                Some(dt) if matches!(self, Value::Date(_)) => write!(f, "{}", dt.date_naive()),
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "<invalid {}>", self.data_type()),
            },
            Value::Time(_) => match self.as_time() {
                Some(t) => write!(f, "{}", t),
                None => write!(f, "<invalid time>"),
            },
            Value::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            other => match other.as_i64() {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::VarChar(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::VarChar(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
