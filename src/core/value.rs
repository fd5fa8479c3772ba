//! Database value types
//!
//! This module defines the tagged union carried between entity fields and
//! tabular rows, plus conversions into the Rust types entities store.

use super::error::{DatabaseError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Text format used to store date/time values
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Text format used to store time-of-day values
pub const TIME_FORMAT: &str = "%H:%M:%S%.f";

/// Database value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 64-bit floating point
    Double(f64),
    /// Exact decimal
    Decimal(Decimal),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Date and time
    DateTime(NaiveDateTime),
    /// Time of day
    Time(NaiveTime),
}

impl DatabaseValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            DatabaseValue::Long(v) => Some(*v != 0),
            DatabaseValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "t" | "y" => Some(true),
                "false" | "0" | "no" | "f" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the value as an i32
    pub fn as_int(&self) -> Option<i32> {
        match self {
            DatabaseValue::Int(v) => Some(*v),
            DatabaseValue::Long(v) => i32::try_from(*v).ok(),
            DatabaseValue::Double(v) => Some(*v as i32),
            DatabaseValue::Decimal(v) => v.to_i32(),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            DatabaseValue::Bool(v) => Some(*v as i32),
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_long(&self) -> Option<i64> {
        match self {
            DatabaseValue::Long(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as i64),
            DatabaseValue::Double(v) => Some(*v as i64),
            DatabaseValue::Decimal(v) => v.to_i64(),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            DatabaseValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_double(&self) -> Option<f64> {
        match self {
            DatabaseValue::Double(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as f64),
            DatabaseValue::Long(v) => Some(*v as f64),
            DatabaseValue::Decimal(v) => v.to_f64(),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get the value as a decimal
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            DatabaseValue::Decimal(v) => Some(*v),
            DatabaseValue::Int(v) => Some(Decimal::from(*v)),
            DatabaseValue::Long(v) => Some(Decimal::from(*v)),
            DatabaseValue::Double(v) => Decimal::from_f64(*v),
            DatabaseValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Get the value as a date/time, parsing the stored text form
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            DatabaseValue::DateTime(v) => Some(*v),
            DatabaseValue::String(s) => {
                let s = s.trim();
                NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
                    .ok()
                    .or_else(|| {
                        NaiveDate::parse_from_str(s, "%Y-%m-%d")
                            .ok()
                            .map(|d| d.and_time(NaiveTime::MIN))
                    })
            }
            _ => None,
        }
    }

    /// Get the value as a time of day, parsing the stored text form
    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            DatabaseValue::Time(v) => Some(*v),
            DatabaseValue::DateTime(v) => Some(v.time()),
            DatabaseValue::String(s) => NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).ok(),
            _ => None,
        }
    }

    /// Get the value as a string (zero-copy for String values)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get the value as a string (with conversion)
    pub fn as_string(&self) -> String {
        match self {
            DatabaseValue::Null => "null".to_string(),
            DatabaseValue::Bool(v) => v.to_string(),
            DatabaseValue::Int(v) => v.to_string(),
            DatabaseValue::Long(v) => v.to_string(),
            DatabaseValue::Double(v) => v.to_string(),
            DatabaseValue::Decimal(v) => v.to_string(),
            DatabaseValue::String(s) => s.clone(),
            DatabaseValue::Bytes(b) => format!("<{} bytes>", b.len()),
            DatabaseValue::DateTime(v) => v.format(DATETIME_FORMAT).to_string(),
            DatabaseValue::Time(v) => v.format(TIME_FORMAT).to_string(),
        }
    }

    /// Get the value as bytes (zero-copy)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            DatabaseValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int(_) => "int",
            DatabaseValue::Long(_) => "long",
            DatabaseValue::Double(_) => "double",
            DatabaseValue::Decimal(_) => "decimal",
            DatabaseValue::String(_) => "string",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::DateTime(_) => "datetime",
            DatabaseValue::Time(_) => "time",
        }
    }

    /// Null-safe equality used for key comparison.
    ///
    /// Integers compare by value regardless of width, and `Null` equals `Null`.
    pub fn same_value(&self, other: &DatabaseValue) -> bool {
        let integral = |v: &DatabaseValue| matches!(v, DatabaseValue::Int(_) | DatabaseValue::Long(_));
        let decimal = |v: &DatabaseValue| matches!(v, DatabaseValue::Decimal(_));

        if integral(self) && integral(other) {
            self.as_long() == other.as_long()
        } else if (decimal(self) || integral(self)) && (decimal(other) || integral(other)) {
            self.as_decimal() == other.as_decimal()
        } else {
            self == other
        }
    }

    /// Convert into a Rust value, failing on an incompatible variant
    pub fn take<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }
}

/// Conversion from a [`DatabaseValue`] into a field type
pub trait FromValue: Sized {
    /// Convert the value, failing with `TypeMismatch` when incompatible
    fn from_value(value: DatabaseValue) -> Result<Self>;
}

macro_rules! from_value {
    ($ty:ty, $name:literal, $conv:expr) => {
        impl FromValue for $ty {
            fn from_value(value: DatabaseValue) -> Result<Self> {
                let conv: fn(&DatabaseValue) -> Option<$ty> = $conv;
                conv(&value).ok_or_else(|| DatabaseError::type_mismatch($name, value.type_name()))
            }
        }
    };
}

from_value!(bool, "bool", DatabaseValue::as_bool);
from_value!(i32, "i32", DatabaseValue::as_int);
from_value!(i64, "i64", DatabaseValue::as_long);
from_value!(f64, "f64", DatabaseValue::as_double);
from_value!(Decimal, "decimal", DatabaseValue::as_decimal);
from_value!(NaiveDateTime, "datetime", DatabaseValue::as_datetime);
from_value!(NaiveTime, "time", DatabaseValue::as_time);

impl FromValue for String {
    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::String(s) => Ok(s),
            DatabaseValue::Null => Ok(String::new()),
            DatabaseValue::Bytes(_) => Err(DatabaseError::type_mismatch("string", "bytes")),
            other => Ok(other.as_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Bytes(b) => Ok(b),
            DatabaseValue::String(s) => Ok(s.into_bytes()),
            DatabaseValue::Null => Ok(Vec::new()),
            other => Err(DatabaseError::type_mismatch("bytes", other.type_name())),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(v: bool) -> Self {
        DatabaseValue::Bool(v)
    }
}

impl From<i32> for DatabaseValue {
    fn from(v: i32) -> Self {
        DatabaseValue::Int(v)
    }
}

impl From<i64> for DatabaseValue {
    fn from(v: i64) -> Self {
        DatabaseValue::Long(v)
    }
}

impl From<f64> for DatabaseValue {
    fn from(v: f64) -> Self {
        DatabaseValue::Double(v)
    }
}

impl From<Decimal> for DatabaseValue {
    fn from(v: Decimal) -> Self {
        DatabaseValue::Decimal(v)
    }
}

impl From<String> for DatabaseValue {
    fn from(v: String) -> Self {
        DatabaseValue::String(v)
    }
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::String(v.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(v: &String) -> Self {
        DatabaseValue::String(v.clone())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(v: Vec<u8>) -> Self {
        DatabaseValue::Bytes(v)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(v: NaiveDateTime) -> Self {
        DatabaseValue::DateTime(v)
    }
}

impl From<NaiveDate> for DatabaseValue {
    fn from(v: NaiveDate) -> Self {
        DatabaseValue::DateTime(v.and_time(NaiveTime::MIN))
    }
}

impl From<NaiveTime> for DatabaseValue {
    fn from(v: NaiveTime) -> Self {
        DatabaseValue::Time(v)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DatabaseValue::Null,
        }
    }
}
