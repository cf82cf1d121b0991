//! Dynamically typed result values.
//!
//! A query's column types are only known once the store has prepared it, so
//! every column carries a [`ScanType`] resolved at execution time and each row
//! is decoded into one [`Slot`] per column. The serialized form of every
//! variant is pinned here rather than left to a driver default.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::store::StoreError;

const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Store-reported type of a result column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Decimal,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Json,
    /// One-dimensional view of a Postgres array; elements keep their own kinds.
    Array,
    /// The column has no fixed type; each value decodes by its own storage class.
    Dynamic,
}

impl ScanType {
    pub fn name(self) -> &'static str {
        match self {
            ScanType::Bool => "bool",
            ScanType::Int => "int",
            ScanType::Float => "float",
            ScanType::Text => "text",
            ScanType::Bytes => "bytes",
            ScanType::Decimal => "decimal",
            ScanType::Date => "date",
            ScanType::Time => "time",
            ScanType::Timestamp => "timestamp",
            ScanType::TimestampTz => "timestamptz",
            ScanType::Json => "json",
            ScanType::Array => "array",
            ScanType::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single decoded value.
#[derive(Clone, Debug, PartialEq)]
pub enum DynamicValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Exact decimal text, never rounded through a float.
    Decimal(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    /// Elements in storage order; multi-dimensional arrays are flattened.
    Array(Vec<DynamicValue>),
}

impl DynamicValue {
    /// The scan type this value naturally belongs to, `None` for null.
    pub fn scan_type(&self) -> Option<ScanType> {
        let kind = match self {
            DynamicValue::Null => return None,
            DynamicValue::Bool(_) => ScanType::Bool,
            DynamicValue::Int(_) => ScanType::Int,
            DynamicValue::Float(_) => ScanType::Float,
            DynamicValue::Text(_) => ScanType::Text,
            DynamicValue::Bytes(_) => ScanType::Bytes,
            DynamicValue::Decimal(_) => ScanType::Decimal,
            DynamicValue::Date(_) => ScanType::Date,
            DynamicValue::Time(_) => ScanType::Time,
            DynamicValue::Timestamp(_) => ScanType::Timestamp,
            DynamicValue::TimestampTz(_) => ScanType::TimestampTz,
            DynamicValue::Json(_) => ScanType::Json,
            DynamicValue::Array(_) => ScanType::Array,
        };
        Some(kind)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }
}

fn non_finite_label(value: f64) -> &'static str {
    if value.is_nan() {
        "NaN"
    } else if value.is_sign_negative() {
        "-Infinity"
    } else {
        "Infinity"
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DynamicValue::Null => serializer.serialize_unit(),
            DynamicValue::Bool(value) => serializer.serialize_bool(*value),
            DynamicValue::Int(value) => serializer.serialize_i64(*value),
            DynamicValue::Float(value) if value.is_finite() => serializer.serialize_f64(*value),
            DynamicValue::Float(value) => serializer.serialize_str(non_finite_label(*value)),
            DynamicValue::Text(value) | DynamicValue::Decimal(value) => {
                serializer.serialize_str(value)
            }
            // JSON has no byte type; binary codecs keep the raw bytes.
            DynamicValue::Bytes(value) if serializer.is_human_readable() => {
                serializer.serialize_str(&BASE64.encode(value))
            }
            DynamicValue::Bytes(value) => serializer.serialize_bytes(value),
            DynamicValue::Date(value) => serializer.collect_str(value),
            DynamicValue::Time(value) => serializer.collect_str(&value.format(TIME_FORMAT)),
            DynamicValue::Timestamp(value) => {
                serializer.collect_str(&value.format(TIMESTAMP_FORMAT))
            }
            DynamicValue::TimestampTz(value) => {
                serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            DynamicValue::Json(value) => value.serialize(serializer),
            DynamicValue::Array(values) => serializer.collect_seq(values),
        }
    }
}

/// Typed destination for one column of the current row.
#[derive(Clone, Debug, PartialEq)]
pub struct Slot {
    scan_type: ScanType,
    value: DynamicValue,
}

impl Slot {
    pub fn typed(scan_type: ScanType) -> Self {
        Self {
            scan_type,
            value: DynamicValue::Null,
        }
    }

    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    pub fn value(&self) -> &DynamicValue {
        &self.value
    }

    /// Stores `value` if it is null or of the slot's declared type.
    pub fn fill(&mut self, value: DynamicValue) -> Result<(), StoreError> {
        match value.scan_type() {
            None => {}
            Some(_) if self.scan_type == ScanType::Dynamic => {}
            Some(kind) if kind == self.scan_type => {}
            Some(kind) => {
                return Err(StoreError::Scan(format!(
                    "cannot store {kind} value in {} column",
                    self.scan_type
                )));
            }
        }
        self.value = value;
        Ok(())
    }

    pub fn into_value(self) -> DynamicValue {
        self.value
    }
}
