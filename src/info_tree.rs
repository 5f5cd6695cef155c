// Copyright 2024 Developers of the tablediff project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Hierarchical record of every bisection decision.
//!
//! Each node tracks one segment pair: its rowcounts, observed key range, and
//! either a leaf diff or aggregates rolled up from its children. Nodes are
//! append-only; parents insert children before the corresponding tasks are
//! submitted, so no task ever observes a partially-constructed parent.
//! [`InfoTree::aggregate_info`] runs bottom-up exactly once; repeated calls
//! are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::rowdiff::DiffEntry;
use crate::schema::ColumnType;
use crate::table::TableSegment;

/// Findings for one segment pair.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    /// Snapshots of the two segments this node compared.
    pub tables: [TableSegment; 2],
    /// Leaf diff, or the concatenation of child diffs after aggregation.
    pub diff: Option<Vec<DiffEntry>>,
    /// Column layout of the diff rows, when a comparison recorded one.
    pub diff_schema: Option<Vec<(String, ColumnType)>>,
    pub is_diff: Option<bool>,
    pub diff_count: Option<u64>,
    /// Presentation-only rendering of the segment's key range.
    pub key_range: Option<(String, String)>,
    /// Row counts per side, as observed by this node.
    pub rowcounts: Option<[u64; 2]>,
    /// Upper bound on rows this node could hold.
    pub max_rows: Option<u64>,
}

impl SegmentInfo {
    fn new(table1: &TableSegment, table2: &TableSegment, max_rows: Option<u64>) -> SegmentInfo {
        SegmentInfo {
            tables: [table1.clone(), table2.clone()],
            diff: None,
            diff_schema: None,
            is_diff: None,
            diff_count: None,
            key_range: None,
            rowcounts: None,
            max_rows,
        }
    }
}

/// A mutable rooted tree of [`SegmentInfo`]s, shared across bisection tasks.
#[derive(Debug)]
pub struct InfoTree {
    info: Mutex<SegmentInfo>,
    children: Mutex<Vec<Arc<InfoTree>>>,
    processed: AtomicBool,
}

impl InfoTree {
    pub fn new(table1: &TableSegment, table2: &TableSegment) -> Arc<InfoTree> {
        Arc::new(InfoTree {
            info: Mutex::new(SegmentInfo::new(table1, table2, None)),
            children: Mutex::new(Vec::new()),
            processed: AtomicBool::new(false),
        })
    }

    /// Append a child node for a sub-segment pair.
    pub fn add_node(
        self: &Arc<InfoTree>,
        table1: &TableSegment,
        table2: &TableSegment,
        max_rows: Option<u64>,
    ) -> Arc<InfoTree> {
        let node = Arc::new(InfoTree {
            info: Mutex::new(SegmentInfo::new(table1, table2, max_rows)),
            children: Mutex::new(Vec::new()),
            processed: AtomicBool::new(false),
        });
        self.children.lock().unwrap().push(node.clone());
        node
    }

    pub fn children(&self) -> Vec<Arc<InfoTree>> {
        self.children.lock().unwrap().clone()
    }

    /// A snapshot of this node's findings.
    pub fn info(&self) -> SegmentInfo {
        self.info.lock().unwrap().clone()
    }

    /// Record a leaf comparison result.
    pub fn set_diff(&self, diff: Vec<DiffEntry>) {
        let mut info = self.info.lock().unwrap();
        info.diff_count = Some(diff.len() as u64);
        info.is_diff = Some(!diff.is_empty());
        info.diff = Some(diff);
    }

    pub fn set_is_diff(&self, is_diff: bool) {
        self.info.lock().unwrap().is_diff = Some(is_diff);
    }

    pub fn set_rowcounts(&self, rowcounts: [u64; 2]) {
        self.info.lock().unwrap().rowcounts = Some(rowcounts);
    }

    pub fn set_key_range(&self, key_range: (String, String)) {
        self.info.lock().unwrap().key_range = Some(key_range);
    }

    pub fn set_max_rows(&self, max_rows: u64) {
        self.info.lock().unwrap().max_rows = Some(max_rows);
    }

    /// Roll findings up from the leaves: interior nodes sum `diff_count` and
    /// rowcounts, OR `is_diff`, inherit the first recorded `diff_schema`, and
    /// concatenate child diffs in child order. Idempotent.
    pub fn aggregate_info(&self) {
        if self.processed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children = self.children();
        for child in &children {
            child.aggregate_info();
        }
        if children.is_empty() {
            return;
        }
        let infos: Vec<SegmentInfo> = children.iter().map(|c| c.info()).collect();

        let mut info = self.info.lock().unwrap();
        info.diff_count = Some(infos.iter().filter_map(|i| i.diff_count).sum());
        info.is_diff = Some(infos.iter().any(|i| i.is_diff == Some(true)));
        info.diff_schema = infos.iter().find_map(|i| i.diff_schema.clone());
        info.diff = Some(
            infos
                .iter()
                .filter_map(|i| i.diff.as_ref())
                .flatten()
                .cloned()
                .collect(),
        );
        info.rowcounts = Some([
            infos.iter().filter_map(|i| i.rowcounts).map(|r| r[0]).sum(),
            infos.iter().filter_map(|i| i.rowcounts).map(|r| r[1]).sum(),
        ]);
        let min_start = infos
            .iter()
            .filter_map(|i| i.key_range.as_ref())
            .map(|r| r.0.clone())
            .min();
        let max_end = infos
            .iter()
            .filter_map(|i| i.key_range.as_ref())
            .map(|r| r.1.clone())
            .max();
        if let (Some(start), Some(end)) = (min_start, max_end) {
            info.key_range = Some((start, end));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::InMemoryTable;
    use crate::rowdiff::Sign;
    use crate::schema::ColumnType;
    use crate::value::Value;

    fn segment() -> TableSegment {
        let table = Arc::new(InMemoryTable::new(
            "t",
            vec![("id", ColumnType::Integer)],
        ));
        table.segment(&["id"], &[])
    }

    fn entry(id: i64) -> DiffEntry {
        (Sign::Plus, vec![Value::Int(id)])
    }

    #[test]
    fn aggregation_sums_and_ors() {
        let seg = segment();
        let root = InfoTree::new(&seg, &seg);
        let left = root.add_node(&seg, &seg, Some(10));
        let right = root.add_node(&seg, &seg, Some(10));

        left.set_rowcounts([5, 5]);
        left.set_diff(vec![entry(1), entry(2)]);
        left.set_key_range(("(0)".into(), "(5)".into()));

        right.set_rowcounts([4, 6]);
        right.set_diff(Vec::new());
        right.set_key_range(("(5)".into(), "(9)".into()));

        root.aggregate_info();
        let info = root.info();
        assert_eq!(info.diff_count, Some(2));
        assert_eq!(info.is_diff, Some(true));
        assert_eq!(info.rowcounts, Some([9, 11]));
        assert_eq!(info.diff.as_ref().map(Vec::len), Some(2));
        assert_eq!(info.key_range, Some(("(0)".into(), "(9)".into())));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let seg = segment();
        let root = InfoTree::new(&seg, &seg);
        let child = root.add_node(&seg, &seg, None);
        child.set_rowcounts([3, 3]);
        child.set_diff(vec![entry(7)]);

        root.aggregate_info();
        let first = root.info();
        root.aggregate_info();
        let second = root.info();

        assert_eq!(first.diff_count, second.diff_count);
        assert_eq!(first.is_diff, second.is_diff);
        assert_eq!(first.rowcounts, second.rowcounts);
        assert_eq!(first.diff, second.diff);
    }

    #[test]
    fn childless_nodes_keep_their_leaf_findings() {
        let seg = segment();
        let root = InfoTree::new(&seg, &seg);
        root.set_rowcounts([2, 2]);
        root.set_diff(vec![entry(1)]);
        root.aggregate_info();
        let info = root.info();
        assert_eq!(info.diff_count, Some(1));
        assert_eq!(info.rowcounts, Some([2, 2]));
    }
}
