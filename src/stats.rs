//! Post-run statistics, derived from the diff stream and the info tree.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::info_tree::InfoTree;
use crate::rowdiff::{DiffEntry, Sign};
use crate::value::Value;

/// Aggregate view of one completed diff run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffSummary {
    /// Top-level row counts per side.
    pub rows_a: u64,
    pub rows_b: u64,
    /// Distinct keys seen only with `-` entries.
    pub exclusive_a: u64,
    /// Distinct keys seen only with `+` entries.
    pub exclusive_b: u64,
    /// Distinct keys seen with both signs.
    pub updated: u64,
    pub unchanged: u64,
    /// `1 - unchanged / max(rows_a, rows_b)`; zero when both sides are empty.
    pub diff_percent: f64,
    /// Extra engine counters, e.g. `rows_downloaded`.
    pub stats: BTreeMap<String, u64>,
}

/// Tracks which signs each key has been seen with while the stream drains.
///
/// A duplicate key can legitimately carry the same sign more than once, so
/// signs are tracked as per-key flags rather than asserted unique.
#[derive(Debug)]
pub(crate) struct SignAccumulator {
    key_len: usize,
    seen: BTreeMap<Vec<Value>, (bool, bool)>,
}

impl SignAccumulator {
    pub(crate) fn new(key_len: usize) -> SignAccumulator {
        SignAccumulator {
            key_len,
            seen: BTreeMap::new(),
        }
    }

    pub(crate) fn record_batch(&mut self, batch: &[DiffEntry]) {
        for (sign, row) in batch {
            let key = row[..self.key_len.min(row.len())].to_vec();
            let flags = self.seen.entry(key).or_insert((false, false));
            match sign {
                Sign::Minus => flags.0 = true,
                Sign::Plus => flags.1 = true,
            }
        }
    }

    pub(crate) fn finish(&self, tree: &InfoTree, stats: BTreeMap<String, u64>) -> DiffSummary {
        let info = tree.info();
        let [rows_a, rows_b] = info.rowcounts.unwrap_or([0, 0]);

        let mut exclusive_a = 0;
        let mut exclusive_b = 0;
        let mut updated = 0;
        for flags in self.seen.values() {
            match flags {
                (true, false) => exclusive_a += 1,
                (false, true) => exclusive_b += 1,
                (true, true) => updated += 1,
                (false, false) => {}
            }
        }

        let unchanged = rows_a.saturating_sub(exclusive_a + updated);
        let largest = rows_a.max(rows_b);
        let diff_percent = if largest == 0 {
            0.0
        } else {
            1.0 - unchanged as f64 / largest as f64
        };

        DiffSummary {
            rows_a,
            rows_b,
            exclusive_a,
            exclusive_b,
            updated,
            unchanged,
            diff_percent,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::InMemoryTable;
    use crate::schema::ColumnType;

    fn tree_with_counts(rows_a: u64, rows_b: u64) -> Arc<InfoTree> {
        let table = Arc::new(InMemoryTable::new("t", vec![("id", ColumnType::Integer)]));
        let segment = table.segment(&["id"], &[]);
        let tree = InfoTree::new(&segment, &segment);
        tree.set_rowcounts([rows_a, rows_b]);
        tree
    }

    fn entry(sign: Sign, id: i64, value: i64) -> DiffEntry {
        (sign, vec![Value::Int(id), Value::Int(value)])
    }

    #[test]
    fn signs_classify_keys() {
        let mut accumulator = SignAccumulator::new(1);
        accumulator.record_batch(&[
            entry(Sign::Minus, 1, 10),
            entry(Sign::Plus, 1, 11),
            entry(Sign::Minus, 2, 20),
            entry(Sign::Plus, 3, 30),
        ]);
        let summary = accumulator.finish(&tree_with_counts(100, 101), BTreeMap::new());
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.exclusive_a, 1);
        assert_eq!(summary.exclusive_b, 1);
        assert_eq!(summary.unchanged, 98);
        assert!((summary.diff_percent - (1.0 - 98.0 / 101.0)).abs() < 1e-12);
    }

    #[test]
    fn duplicate_keys_count_once() {
        let mut accumulator = SignAccumulator::new(1);
        accumulator.record_batch(&[
            entry(Sign::Minus, 7, 70),
            entry(Sign::Minus, 7, 71),
            entry(Sign::Plus, 7, 70),
        ]);
        let summary = accumulator.finish(&tree_with_counts(10, 9), BTreeMap::new());
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.exclusive_a, 0);
        assert_eq!(summary.exclusive_b, 0);
    }

    #[test]
    fn empty_runs_divide_by_nothing() {
        let accumulator = SignAccumulator::new(1);
        let summary = accumulator.finish(&tree_with_counts(0, 0), BTreeMap::new());
        assert_eq!(summary.diff_percent, 0.0);
        assert_eq!(summary.unchanged, 0);
    }
}
