//! Cell values, canonical normalization, and commutative row checksums.
//!
//! Checksums must be identical for identical row content across databases, so
//! every value is rendered into a canonical text form before hashing. The
//! canonical form is driven by the mutually-reconciled column type: both sides
//! truncate timestamps and round numerics to the same precision.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use xxhash_rust::xxh3::xxh3_128;

use crate::key::KeyValue;
use crate::schema::ColumnType;

/// A fetched row, aligned with a segment's relevant columns.
pub type Row = Vec<Value>;

/// Canonical encoding markers, distinct from any plain string content.
const NULL_MARKER: &str = "\x00NULL\x00";
const COLUMN_SEPARATOR: char = '\x1e';

/// A single cell value.
#[derive(Clone, Debug, Serialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(u128),
    Json(String),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Date(_) => 6,
            Value::Uuid(_) => 7,
            Value::Json(_) => 8,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Convert a cell value into a key component, when its type is key-eligible.
pub fn to_key_value(value: &Value) -> Option<KeyValue> {
    match value {
        Value::Int(v) => Some(KeyValue::Int(*v)),
        Value::Timestamp(t) => Some(KeyValue::Timestamp(*t)),
        Value::Date(d) => d
            .and_hms_opt(0, 0, 0)
            .map(|midnight| KeyValue::Timestamp(midnight.and_utc())),
        Value::Uuid(v) => Some(KeyValue::Uuid(*v)),
        Value::Text(s) => Some(KeyValue::Text(s.clone())),
        _ => None,
    }
}

/// Reduce a value to the canonical form both sides agree on after schema
/// reconciliation: timestamps truncated and numerics rounded to the mutual
/// precision. Other values pass through unchanged.
pub fn normalize_value(value: &Value, ty: &ColumnType) -> Value {
    match (value, ty) {
        (Value::Timestamp(t), ColumnType::Timestamp { precision, rounds }) => {
            Value::Timestamp(truncate_timestamp(*t, *precision, *rounds))
        }
        (Value::Float(x), ColumnType::Float { precision })
        | (Value::Float(x), ColumnType::Decimal { precision }) => {
            Value::Float(round_to_precision(*x, *precision))
        }
        _ => value.clone(),
    }
}

fn truncate_timestamp(t: DateTime<Utc>, precision: u32, rounds: bool) -> DateTime<Utc> {
    let precision = precision.min(6);
    let unit = 10i64.pow(6 - precision);
    let micros = t.timestamp_micros();
    let rem = micros.rem_euclid(unit);
    let mut base = micros - rem;
    if rounds && rem * 2 >= unit {
        base += unit;
    }
    DateTime::from_timestamp_micros(base).unwrap_or(t)
}

fn round_to_precision(x: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision.min(12) as i32);
    (x * scale).round() / scale
}

/// Render a value into the canonical text form used for checksumming.
pub fn canonical_text(value: &Value, ty: Option<&ColumnType>) -> String {
    match value {
        Value::Null => NULL_MARKER.to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Float(x) => match ty {
            Some(ColumnType::Float { precision }) | Some(ColumnType::Decimal { precision }) => {
                format!("{:.*}", *precision as usize, x)
            }
            _ => format!("{x}"),
        },
        Value::Text(s) => s.clone(),
        Value::Timestamp(t) => t.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        Value::Date(d) => d.format("%Y-%m-%d").to_string(),
        Value::Uuid(v) => format!("{v:032x}"),
        Value::Json(s) => s.clone(),
    }
}

/// Deterministic 128-bit digest of one row's canonical field encodings.
pub fn row_digest(fields: impl IntoIterator<Item = String>) -> u128 {
    let mut buf = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            buf.push(COLUMN_SEPARATOR);
        }
        buf.push_str(&field);
    }
    xxh3_128(buf.as_bytes())
}

/// Fold one row digest into a segment checksum. Wrapping addition keeps the
/// checksum independent of row order and sensitive to duplicate rows.
pub fn combine_checksum(checksum: u128, digest: u128) -> u128 {
    checksum.wrapping_add(digest)
}

/// True when both values hold semantically equal JSON despite differing
/// serialized forms.
pub fn jsons_equivalent(a: &Value, b: &Value) -> bool {
    let (Some(text_a), Some(text_b)) = (json_text(a), json_text(b)) else {
        return false;
    };
    match (
        serde_json::from_str::<serde_json::Value>(text_a),
        serde_json::from_str::<serde_json::Value>(text_b),
    ) {
        (Ok(parsed_a), Ok(parsed_b)) => parsed_a == parsed_b,
        _ => false,
    }
}

fn json_text(value: &Value) -> Option<&str> {
    match value {
        Value::Json(s) | Value::Text(s) => Some(s),
        _ => None,
    }
}
