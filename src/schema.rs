//! Column types and schema reconciliation.
//!
//! Before any bisection starts, the two sides' schemas are reduced to a
//! mutually comparable form: precision-bearing pairs drop to the minimum
//! precision and rounding mode, numeric pairs equalize precision, and columns
//! with no compatibility handling are warned about but kept.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::error::DiffError;
use crate::key::{KeyKind, MAX_KEY_PARTS};

/// Database-agnostic column type, carrying only what comparison needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ColumnType {
    Integer,
    Boolean,
    /// Fixed-point numeric with `precision` fractional digits.
    Decimal { precision: u32 },
    /// Floating-point numeric compared at `precision` fractional digits.
    Float { precision: u32 },
    /// Timestamp with `precision` fractional-second digits. `rounds` marks
    /// databases that round rather than truncate on storage.
    Timestamp { precision: u32, rounds: bool },
    Date,
    Text,
    Uuid,
    Json,
    /// A type with no compatibility handling; kept, but warned about.
    Unsupported { name: String },
}

impl ColumnType {
    /// Kind of key arithmetic this type supports, if it is key-eligible.
    pub fn key_kind(&self) -> Option<KeyKind> {
        match self {
            ColumnType::Integer => Some(KeyKind::Int),
            ColumnType::Timestamp { .. } | ColumnType::Date => Some(KeyKind::Timestamp),
            ColumnType::Uuid => Some(KeyKind::Uuid),
            ColumnType::Text => Some(KeyKind::Text),
            _ => None,
        }
    }

    fn is_precision(&self) -> bool {
        matches!(self, ColumnType::Timestamp { .. })
    }

    fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Decimal { .. } | ColumnType::Float { .. } | ColumnType::Boolean
        )
    }

    fn precision(&self) -> u32 {
        match self {
            ColumnType::Decimal { precision }
            | ColumnType::Float { precision }
            | ColumnType::Timestamp { precision, .. } => *precision,
            _ => 0,
        }
    }

    fn with_precision(&self, precision: u32) -> ColumnType {
        match self {
            ColumnType::Decimal { .. } => ColumnType::Decimal { precision },
            ColumnType::Float { .. } => ColumnType::Float { precision },
            ColumnType::Timestamp { rounds, .. } => ColumnType::Timestamp {
                precision,
                rounds: *rounds,
            },
            other => other.clone(),
        }
    }

    pub fn supported(&self) -> bool {
        !matches!(self, ColumnType::Unsupported { .. })
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Integer => write!(f, "integer"),
            ColumnType::Boolean => write!(f, "boolean"),
            ColumnType::Decimal { precision } => write!(f, "decimal({precision})"),
            ColumnType::Float { precision } => write!(f, "float({precision})"),
            ColumnType::Timestamp { precision, .. } => write!(f, "timestamp({precision})"),
            ColumnType::Date => write!(f, "date"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Uuid => write!(f, "uuid"),
            ColumnType::Json => write!(f, "json"),
            ColumnType::Unsupported { name } => write!(f, "unsupported({name})"),
        }
    }
}

/// Column name to type mapping for one table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    columns: HashMap<String, ColumnType>,
}

impl Schema {
    pub fn new(columns: impl IntoIterator<Item = (String, ColumnType)>) -> Schema {
        Schema {
            columns: columns.into_iter().collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ColumnType> {
        self.columns.get(column)
    }

    pub fn insert(&mut self, column: String, ty: ColumnType) {
        self.columns.insert(column, ty);
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Reduce both schemas to the minimal mutual precision, pair by pair.
///
/// `columns1`/`columns2` are the relevant columns of the two sides, in
/// matching order. Incompatible pairs are errors; unknown types only warn.
pub fn reconcile_schemas(
    schema1: &mut Schema,
    schema2: &mut Schema,
    columns1: &[String],
    columns2: &[String],
    table1: &str,
    table2: &str,
) -> Result<(), DiffError> {
    if columns1.len() != columns2.len() {
        return Err(DiffError::Schema(format!(
            "tables have {} and {} relevant columns; they must match",
            columns1.len(),
            columns2.len()
        )));
    }

    for (c1, c2) in columns1.iter().zip(columns2) {
        let col1 = schema1.get(c1).cloned().ok_or_else(|| {
            DiffError::Schema(format!("column '{c1}' not found in schema for table {table1}"))
        })?;
        let col2 = schema2.get(c2).cloned().ok_or_else(|| {
            DiffError::Schema(format!("column '{c2}' not found in schema for table {table2}"))
        })?;

        if col1.is_precision() {
            if !col2.is_precision() {
                return Err(DiffError::Schema(format!(
                    "incompatible types for column '{c1}': {col1} <-> {col2}"
                )));
            }
            let (precision, rounds) = lowest_timestamp(&col1, &col2);
            if col1.precision() != col2.precision() {
                warn!(
                    "using reduced precision timestamp({precision}) for column '{c1}'; \
                     types were {col1}, {col2}"
                );
            }
            schema1.insert(c1.clone(), ColumnType::Timestamp { precision, rounds });
            schema2.insert(c2.clone(), ColumnType::Timestamp { precision, rounds });
        } else if col1.is_numeric() {
            if !col2.is_numeric() {
                return Err(DiffError::Schema(format!(
                    "incompatible types for column '{c1}': {col1} <-> {col2}"
                )));
            }
            let precision = col1.precision().min(col2.precision());
            if col1.precision() != col2.precision() {
                warn!(
                    "using reduced precision {precision} for column '{c1}'; \
                     types were {col1}, {col2}"
                );
            }
            if col1.precision() != precision {
                schema1.insert(c1.clone(), col1.with_precision(precision));
            }
            if col2.precision() != precision {
                schema2.insert(c2.clone(), col2.with_precision(precision));
            }
        } else if col2.is_precision() || col2.is_numeric() {
            return Err(DiffError::Schema(format!(
                "incompatible types for column '{c1}': {col1} <-> {col2}"
            )));
        }
    }

    for (table, schema, columns) in [(table1, &*schema1, columns1), (table2, &*schema2, columns2)] {
        for column in columns {
            if let Some(ty) = schema.get(column) {
                if !ty.supported() {
                    warn!(
                        "[{table}] column '{column}' of type '{ty}' has no compatibility \
                         handling; if encoding differs between databases it may produce \
                         false positives"
                    );
                }
            }
        }
    }

    Ok(())
}

fn lowest_timestamp(col1: &ColumnType, col2: &ColumnType) -> (u32, bool) {
    let rounds = |col: &ColumnType| matches!(col, ColumnType::Timestamp { rounds: true, .. });
    if col2.precision() < col1.precision() {
        (col2.precision(), rounds(col2))
    } else {
        (col1.precision(), rounds(col1))
    }
}

/// Validate the paired key columns: equal count, key-eligible types, and
/// exactly matching semantic kinds.
pub fn validate_key_columns(
    keys1: &[(String, ColumnType)],
    keys2: &[(String, ColumnType)],
) -> Result<Vec<KeyKind>, DiffError> {
    if keys1.len() != keys2.len() {
        return Err(DiffError::Schema(
            "tables should have an equivalent number of key columns".into(),
        ));
    }
    if keys1.is_empty() {
        return Err(DiffError::Schema("at least one key column is required".into()));
    }
    if keys1.len() > MAX_KEY_PARTS {
        return Err(DiffError::Schema(format!(
            "compound keys are limited to {MAX_KEY_PARTS} columns"
        )));
    }

    let mut kinds = Vec::with_capacity(keys1.len());
    for ((name1, ty1), (name2, ty2)) in keys1.iter().zip(keys2) {
        let kind1 = ty1.key_kind().ok_or_else(|| {
            DiffError::Schema(format!("cannot use column '{name1}' of type {ty1} as a key"))
        })?;
        let kind2 = ty2.key_kind().ok_or_else(|| {
            DiffError::Schema(format!("cannot use column '{name2}' of type {ty2} as a key"))
        })?;
        if kind1 != kind2 {
            return Err(DiffError::MismatchingKeyTypes(name1.clone(), name2.clone()));
        }
        kinds.push(kind1);
    }
    Ok(kinds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn timestamps_reduce_to_minimum_precision_and_rounding() {
        let mut s1 = Schema::new([(
            "ts".to_string(),
            ColumnType::Timestamp { precision: 6, rounds: false },
        )]);
        let mut s2 = Schema::new([(
            "ts".to_string(),
            ColumnType::Timestamp { precision: 3, rounds: true },
        )]);
        reconcile_schemas(&mut s1, &mut s2, &columns(&["ts"]), &columns(&["ts"]), "a", "b")
            .unwrap();
        let expected = ColumnType::Timestamp { precision: 3, rounds: true };
        assert_eq!(s1.get("ts"), Some(&expected));
        assert_eq!(s2.get("ts"), Some(&expected));
    }

    #[test]
    fn numerics_equalize_precision() {
        let mut s1 = Schema::new([("v".to_string(), ColumnType::Decimal { precision: 4 })]);
        let mut s2 = Schema::new([("v".to_string(), ColumnType::Float { precision: 2 })]);
        reconcile_schemas(&mut s1, &mut s2, &columns(&["v"]), &columns(&["v"]), "a", "b")
            .unwrap();
        assert_eq!(s1.get("v"), Some(&ColumnType::Decimal { precision: 2 }));
        assert_eq!(s2.get("v"), Some(&ColumnType::Float { precision: 2 }));
    }

    #[test]
    fn mixed_categories_are_rejected() {
        let mut s1 = Schema::new([(
            "x".to_string(),
            ColumnType::Timestamp { precision: 6, rounds: false },
        )]);
        let mut s2 = Schema::new([("x".to_string(), ColumnType::Integer)]);
        let err = reconcile_schemas(&mut s1, &mut s2, &columns(&["x"]), &columns(&["x"]), "a", "b")
            .unwrap_err();
        assert!(matches!(err, DiffError::Schema(_)));
    }

    #[test]
    fn unsupported_types_are_kept() {
        let odd = ColumnType::Unsupported { name: "geometry".into() };
        let mut s1 = Schema::new([("g".to_string(), odd.clone())]);
        let mut s2 = Schema::new([("g".to_string(), odd.clone())]);
        reconcile_schemas(&mut s1, &mut s2, &columns(&["g"]), &columns(&["g"]), "a", "b")
            .unwrap();
        assert_eq!(s1.get("g"), Some(&odd));
    }

    #[test]
    fn missing_column_is_a_schema_error() {
        let mut s1 = Schema::default();
        let mut s2 = Schema::new([("v".to_string(), ColumnType::Integer)]);
        let err = reconcile_schemas(&mut s1, &mut s2, &columns(&["v"]), &columns(&["v"]), "a", "b")
            .unwrap_err();
        assert!(matches!(err, DiffError::Schema(_)));
    }

    #[test]
    fn key_kinds_must_match_exactly() {
        let keys1 = vec![("id".to_string(), ColumnType::Integer)];
        let keys2 = vec![("id".to_string(), ColumnType::Text)];
        let err = validate_key_columns(&keys1, &keys2).unwrap_err();
        assert!(matches!(err, DiffError::MismatchingKeyTypes(_, _)));
    }

    #[test]
    fn non_key_eligible_types_are_rejected() {
        let keys1 = vec![("j".to_string(), ColumnType::Json)];
        let keys2 = vec![("j".to_string(), ColumnType::Json)];
        let err = validate_key_columns(&keys1, &keys2).unwrap_err();
        assert!(matches!(err, DiffError::Schema(_)));
    }
}
