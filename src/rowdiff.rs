//! Leaf comparison: set-diff of two downloaded row sets.
//!
//! Rows are grouped by their key tuple on each side and the keys walked in
//! sorted order. A key whose (ignored-column-cut) rows do not match exactly
//! one-to-one emits its whole group: every `-` row of side A, then every `+`
//! row of side B. Duplicates are surfaced whole: two or more rows for one key
//! on either side emit everything for that key regardless of values.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::value::{jsons_equivalent, Row, Value};

/// Which side a diff row belongs to: `-` is exclusive to A, `+` to B.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Sign {
    Minus,
    Plus,
}

impl Sign {
    pub fn as_char(self) -> char {
        match self {
            Sign::Minus => '-',
            Sign::Plus => '+',
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One element of the diff stream: a signed full row.
pub type DiffEntry = (Sign, Row);

/// Column layout shared by one leaf comparison.
pub struct RowDiffParams<'a> {
    /// Relevant columns of each side, aligned with the fetched rows.
    pub columns_a: &'a [String],
    pub columns_b: &'a [String],
    /// Number of leading key columns.
    pub key_len: usize,
    /// Ignored column names per side; cut before comparison, never from the
    /// emitted rows.
    pub ignored_a: &'a BTreeSet<String>,
    pub ignored_b: &'a BTreeSet<String>,
    /// Row positions holding JSON, for the semantic-equivalence post-filter.
    pub json_columns: &'a HashMap<usize, String>,
}

/// Set-diff two downloaded row sets.
pub fn diff_sets(rows_a: &[Row], rows_b: &[Row], params: &RowDiffParams<'_>) -> Vec<DiffEntry> {
    let mut by_pk_a: BTreeMap<Vec<Value>, Vec<&Row>> = BTreeMap::new();
    for row in rows_a {
        by_pk_a.entry(row[..params.key_len].to_vec()).or_default().push(row);
    }
    let mut by_pk_b: BTreeMap<Vec<Value>, Vec<&Row>> = BTreeMap::new();
    for row in rows_b {
        by_pk_b.entry(row[..params.key_len].to_vec()).or_default().push(row);
    }

    let keep_a = kept_positions(params.columns_a, params.ignored_a);
    let keep_b = kept_positions(params.columns_b, params.ignored_b);

    let mut keys: BTreeSet<&Vec<Value>> = by_pk_a.keys().collect();
    keys.extend(by_pk_b.keys());

    let mut entries = Vec::new();
    let mut warned = BTreeSet::new();
    for pk in keys {
        let group_a: &[&Row] = by_pk_a.get(pk).map_or(&[], Vec::as_slice);
        let group_b: &[&Row] = by_pk_b.get(pk).map_or(&[], Vec::as_slice);

        let cut_a: Vec<Vec<&Value>> = group_a.iter().map(|r| cut_row(r, &keep_a)).collect();
        let cut_b: Vec<Vec<&Value>> = group_b.iter().map(|r| cut_row(r, &keep_b)).collect();

        // One row on each side with equal kept values: nothing to report.
        // Zero rows on a side, duplicates, or differing values: the whole
        // group goes out, `-` rows first.
        if cut_a.len() == 1 && cut_b.len() == 1 && cut_a == cut_b {
            continue;
        }
        let group: Vec<DiffEntry> = group_a
            .iter()
            .map(|r| (Sign::Minus, (*r).clone()))
            .chain(group_b.iter().map(|r| (Sign::Plus, (*r).clone())))
            .collect();
        if !params.json_columns.is_empty()
            && group_is_equivalent_json(&group, params.json_columns, &mut warned)
        {
            continue;
        }
        entries.extend(group);
    }
    entries
}

fn kept_positions(columns: &[String], ignored: &BTreeSet<String>) -> Vec<usize> {
    columns
        .iter()
        .enumerate()
        .filter(|(_, name)| !ignored.contains(*name))
        .map(|(i, _)| i)
        .collect()
}

fn cut_row<'a>(row: &'a Row, kept: &[usize]) -> Vec<&'a Value> {
    kept.iter().map(|&i| &row[i]).collect()
}

/// True when a `-`/`+` pair differs only in JSON columns whose values are
/// semantically equal. Suppressed columns are warned about once per leaf.
fn group_is_equivalent_json(
    group: &[DiffEntry],
    json_columns: &HashMap<usize, String>,
    warned: &mut BTreeSet<String>,
) -> bool {
    if group.len() != 2 || group[0].0 != Sign::Minus || group[1].0 != Sign::Plus {
        return false;
    }
    let (row_a, row_b) = (&group[0].1, &group[1].1);
    if row_a.len() != row_b.len() {
        return false;
    }
    let mut overridden = Vec::new();
    for (i, (a, b)) in row_a.iter().zip(row_b).enumerate() {
        if a == b {
            continue;
        }
        match json_columns.get(&i) {
            Some(name) if jsons_equivalent(a, b) => overridden.push(name),
            _ => return false,
        }
    }
    for name in overridden {
        if warned.insert(name.clone()) {
            warn!(
                "equivalent JSON objects with different string representations detected in \
                 column '{name}'; these cases are not reported as differences"
            );
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn row(id: i64, value: i64) -> Row {
        vec![Value::Int(id), Value::Int(value)]
    }

    fn params<'a>(
        cols: &'a [String],
        ignored: &'a BTreeSet<String>,
        json: &'a HashMap<usize, String>,
    ) -> RowDiffParams<'a> {
        RowDiffParams {
            columns_a: cols,
            columns_b: cols,
            key_len: 1,
            ignored_a: ignored,
            ignored_b: ignored,
            json_columns: json,
        }
    }

    #[test]
    fn exclusive_and_updated_rows() {
        let cols = columns(&["id", "value"]);
        let ignored = BTreeSet::new();
        let json = HashMap::new();
        let a = vec![row(1, 10), row(2, 20), row(3, 30)];
        let b = vec![row(1, 10), row(2, 25), row(4, 40)];
        let diff = diff_sets(&a, &b, &params(&cols, &ignored, &json));
        assert_eq!(
            diff,
            vec![
                (Sign::Minus, row(2, 20)),
                (Sign::Plus, row(2, 25)),
                (Sign::Minus, row(3, 30)),
                (Sign::Plus, row(4, 40)),
            ]
        );
    }

    #[test]
    fn duplicates_emit_every_row_for_the_key() {
        let cols = columns(&["id", "value"]);
        let ignored = BTreeSet::new();
        let json = HashMap::new();
        // Side A holds key 7 twice; one of the rows matches B exactly.
        let a = vec![row(7, 70), row(7, 71)];
        let b = vec![row(7, 70)];
        let diff = diff_sets(&a, &b, &params(&cols, &ignored, &json));
        assert_eq!(
            diff,
            vec![
                (Sign::Minus, row(7, 70)),
                (Sign::Minus, row(7, 71)),
                (Sign::Plus, row(7, 70)),
            ]
        );
    }

    #[test]
    fn ignored_columns_are_cut_from_comparison_not_output() {
        let cols = columns(&["id", "value"]);
        let ignored: BTreeSet<String> = ["value".to_string()].into();
        let json = HashMap::new();
        let a = vec![row(1, 10)];
        let b = vec![row(1, 99)];
        assert!(diff_sets(&a, &b, &params(&cols, &ignored, &json)).is_empty());

        // An exclusive key still emits its full row, ignored column included.
        let b = vec![row(1, 99), row(2, 20)];
        let diff = diff_sets(&a, &b, &params(&cols, &ignored, &json));
        assert_eq!(diff, vec![(Sign::Plus, row(2, 20))]);
    }

    #[test]
    fn equivalent_json_groups_are_suppressed() {
        let cols = columns(&["id", "payload"]);
        let ignored = BTreeSet::new();
        let json: HashMap<usize, String> = [(1, "payload".to_string())].into();
        let a = vec![vec![Value::Int(1), Value::Json(r#"{"x": 1, "y": 2}"#.into())]];
        let b = vec![vec![Value::Int(1), Value::Json(r#"{"y":2,"x":1}"#.into())]];
        assert!(diff_sets(&a, &b, &params(&cols, &ignored, &json)).is_empty());

        // Genuinely different JSON still comes out.
        let c = vec![vec![Value::Int(1), Value::Json(r#"{"x": 9}"#.into())]];
        assert_eq!(diff_sets(&a, &c, &params(&cols, &ignored, &json)).len(), 2);
    }

    #[test]
    fn keys_iterate_in_sorted_order() {
        let cols = columns(&["id", "value"]);
        let ignored = BTreeSet::new();
        let json = HashMap::new();
        let a = vec![row(9, 1), row(3, 1)];
        let b = vec![];
        let diff = diff_sets(&a, &b, &params(&cols, &ignored, &json));
        assert_eq!(diff[0].1[0], Value::Int(3));
        assert_eq!(diff[1].1[0], Value::Int(9));
    }
}
