// Copyright 2024 Developers of the tablediff project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The hash-bisection diff engine.
//!
//! [`HashDiffer`] compares two table segments by querying row-group checksums
//! server-side and recursively bisecting only the ranges whose checksums
//! differ. Full rows are downloaded only for the smallest differing leaves,
//! so the bytes moved scale with the size of the diff, not the tables.
//!
//! Works best for tables that are mostly the same, with minor discrepancies.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{select, BoxFuture, Either};
use futures::FutureExt;
use tracing::{debug, info};

use crate::error::DiffError;
use crate::info_tree::InfoTree;
use crate::key::{KeyRange, KeyValue};
use crate::mesh;
use crate::rowdiff::{self, RowDiffParams};
use crate::schema::{self, ColumnType};
use crate::table::TableSegment;
use crate::tracking;
use crate::yielder::{DiffStream, TaskOutcome, ThreadedYielder};

pub const DEFAULT_BISECTION_FACTOR: usize = 32;
pub const DEFAULT_BISECTION_THRESHOLD: u64 = 1024 * 16;
pub const DEFAULT_SEGMENT_ROWS: u64 = 50_000;

/// Reserved priority for the top-level seed tasks. Lower values run sooner,
/// so in-progress split work always preempts the remaining top-level boxes.
const TOP_LEVEL_PRIORITY: u32 = 999;

/// Options recognized by the differ.
#[derive(Clone, Debug)]
pub struct DiffOptions {
    /// Into how many segments to bisect per iteration.
    pub bisection_factor: usize,
    /// Row count below which a segment is downloaded and compared locally.
    pub bisection_threshold: u64,
    /// Always download and compare locally; used by tests.
    pub bisection_disabled: bool,
    /// Derive the factor per segment from `rows / segment_rows`.
    pub auto_bisection_factor: bool,
    /// Preferred leaf size for the automatic factor.
    pub segment_rows: u64,
    /// Run segment queries on a worker pool; `false` degenerates to in-order
    /// synchronous execution.
    pub threaded: bool,
    /// Bound on the worker pool.
    pub max_threadpool_size: usize,
}

impl Default for DiffOptions {
    fn default() -> DiffOptions {
        DiffOptions {
            bisection_factor: DEFAULT_BISECTION_FACTOR,
            bisection_threshold: DEFAULT_BISECTION_THRESHOLD,
            bisection_disabled: false,
            auto_bisection_factor: false,
            segment_rows: DEFAULT_SEGMENT_ROWS,
            threaded: true,
            max_threadpool_size: 8,
        }
    }
}

/// Finds the diff between two SQL tables using hashing and recursive
/// bisection.
///
/// The returned [`DiffStream`] yields `(sign, row)` pairs as they are
/// discovered: `-` rows exist only in table A, `+` rows only in table B, and
/// an updated row appears as one of each under the same key.
#[derive(Debug)]
pub struct HashDiffer {
    options: DiffOptions,
    ignored_columns: Arc<Mutex<(BTreeSet<String>, BTreeSet<String>)>>,
    stats: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl HashDiffer {
    pub fn new(options: DiffOptions) -> Result<HashDiffer, DiffError> {
        if options.bisection_factor < 2 {
            return Err(DiffError::InvalidOptions(
                "must have at least two segments per iteration (bisection_factor >= 2)".into(),
            ));
        }
        if options.bisection_factor as u64 >= options.bisection_threshold {
            return Err(DiffError::InvalidOptions(
                "bisection factor must be lower than the bisection threshold".into(),
            ));
        }
        Ok(HashDiffer {
            options,
            ignored_columns: Arc::new(Mutex::new((BTreeSet::new(), BTreeSet::new()))),
            stats: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn with_defaults() -> HashDiffer {
        HashDiffer::new(DiffOptions::default()).expect("default options are valid")
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Ignore a column (by name on sides A and B) in checksums and diffs from
    /// now on. Segments created after the call exclude the column from their
    /// checksums; leaves compared after the call exclude it from in-memory
    /// diffing. Fetched row content is never affected.
    pub fn ignore_column(&self, column_a: impl Into<String>, column_b: impl Into<String>) {
        let mut guard = self.ignored_columns.lock().unwrap();
        guard.0.insert(column_a.into());
        guard.1.insert(column_b.into());
    }

    /// Diff the given tables.
    ///
    /// Schema queries, reconciliation and key validation run before this
    /// returns; their failures are returned directly. Failures after the
    /// bisection starts surface on the stream.
    pub async fn diff_tables(
        &self,
        table1: TableSegment,
        table2: TableSegment,
    ) -> Result<DiffStream, DiffError> {
        let started = Instant::now();
        tracking::send_start_event(&self.options);
        match self.start_diff(table1, table2, started).await {
            Ok(stream) => Ok(stream),
            Err(error) => {
                tracking::send_end_event(
                    false,
                    started.elapsed(),
                    None,
                    None,
                    Some(&error.to_string()),
                );
                Err(error)
            }
        }
    }

    async fn start_diff(
        &self,
        table1: TableSegment,
        table2: TableSegment,
        started: Instant,
    ) -> Result<DiffStream, DiffError> {
        if table1.source().prevent_overflow_when_concat()
            || table2.source().prevent_overflow_when_concat()
        {
            table1.source().enable_preventing_type_overflow();
            table2.source().enable_preventing_type_overflow();
        }

        // Query and validate schemas.
        let (table1, table2) =
            futures::try_join!(table1.with_schema(), table2.with_schema())?;
        let (table1, table2) = reconcile_tables(table1, table2)?;

        let root = InfoTree::new(&table1, &table2);
        let concurrency = if self.options.threaded {
            self.options.max_threadpool_size
        } else {
            1
        };
        let (yielder, receiver) = ThreadedYielder::new(concurrency);
        let engine = Arc::new(Engine {
            options: self.options.clone(),
            yielder: yielder.clone(),
            ignored_columns: self.ignored_columns.clone(),
            stats: self.stats.clone(),
        });

        // Query both min/max key ranges in parallel; whichever returns first
        // defines the primary diff box, so neither side blocks the other.
        let fut1 = table1.query_key_range().boxed();
        let fut2 = table2.query_key_range().boxed();
        let (first, rest) = match select(fut1, fut2).await {
            Either::Left((result, rest)) => (result?, rest),
            Either::Right((result, rest)) => (result?, rest),
        };

        let mut seeded = false;
        if let Some(range) = &first {
            seed_box(&engine, &table1, &table2, &root, range);
            seeded = true;
        }

        // The second min/max marks the portions the primary box missed. The
        // key-range difference divides into aligned boxes; with a 2-D
        // compound key, where the first range A was observed first, the
        // second pass covers the regions B1..B8:
        //   ┌──┬──────┬──┐
        //   │B1│  B2  │B3│
        //   ├──┼──────┼──┤
        //   │B4│  A   │B5│
        //   ├──┼──────┼──┤
        //   │B6│  B7  │B8│
        //   └──┴──────┴──┘
        // At most 3^|k| - 1 new regions.
        let second = rest.await?;
        match (&first, &second) {
            (Some(primary), Some(other)) => {
                for region in second_pass_regions(primary, other) {
                    seed_box(&engine, &table1, &table2, &root, &region);
                }
            }
            (None, Some(range)) => {
                seed_box(&engine, &table1, &table2, &root, range);
                seeded = true;
            }
            _ => {}
        }

        if !seeded {
            root.set_rowcounts([0, 0]);
            root.set_is_diff(false);
        }

        let supervisor_yielder = yielder.clone();
        let supervisor_tree = root.clone();
        tokio::spawn(async move {
            supervisor_yielder.drive().await;
            supervisor_tree.aggregate_info();
            let info = supervisor_tree.info();
            let error = supervisor_yielder.error();
            tracking::send_end_event(
                error.is_none(),
                started.elapsed(),
                info.rowcounts,
                info.diff_count,
                error.map(|e| e.to_string()).as_deref(),
            );
        });

        Ok(DiffStream::new(
            receiver,
            root,
            table1.key_columns().len(),
            self.stats.clone(),
        ))
    }
}

struct Engine {
    options: DiffOptions,
    yielder: ThreadedYielder,
    ignored_columns: Arc<Mutex<(BTreeSet<String>, BTreeSet<String>)>>,
    stats: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Engine {
    fn ignored_snapshot(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let guard = self.ignored_columns.lock().unwrap();
        (guard.0.clone(), guard.1.clone())
    }
}

/// Bound both tables to one top-level box and submit its bisection.
fn seed_box(
    engine: &Arc<Engine>,
    table1: &TableSegment,
    table2: &TableSegment,
    root: &Arc<InfoTree>,
    range: &KeyRange,
) {
    let bounded1 = table1.new_key_bounds(range.clone());
    let bounded2 = table2.new_key_bounds(range.clone());
    info!(
        "diffing segments at key-range {range}; size: table1 <= {}, table2 <= {}",
        bounded1.approximate_size(),
        bounded2.approximate_size()
    );
    // Each top-level box gets its own node, so the root aggregates cleanly
    // over the primary box and every second-pass box.
    let node = root.add_node(&bounded1, &bounded2, None);
    engine.yielder.submit(
        TOP_LEVEL_PRIORITY,
        bisect_and_diff_segments(engine.clone(), bounded1, bounded2, node, 0, None),
    );
}

/// The aligned boxes covering whatever the primary box missed.
fn second_pass_regions(primary: &KeyRange, other: &KeyRange) -> Vec<KeyRange> {
    let points: Vec<[KeyValue; 4]> = (0..primary.dimensions())
        .map(|dim| {
            let mut quad = [
                primary.min()[dim].clone(),
                other.min()[dim].clone(),
                primary.max()[dim].clone(),
                other.max()[dim].clone(),
            ];
            quad.sort();
            quad
        })
        .collect();
    mesh::uncovered_boxes(mesh::create_mesh_from_points(&points), primary)
}

/// One bisection step: prune on equal checksums or recurse.
async fn diff_segments(
    engine: Arc<Engine>,
    table1: TableSegment,
    table2: TableSegment,
    node: Arc<InfoTree>,
    level: usize,
    segment_index: usize,
    segment_count: usize,
) -> TaskOutcome {
    let ((count1, checksum1), (count2, checksum2)) =
        futures::try_join!(table1.count_and_checksum(), table2.count_and_checksum())?;
    node.set_rowcounts([count1, count2]);
    node.set_key_range(key_range_display(&table1, &table2));
    info!(
        "{}segment {segment_index}/{segment_count}, rows: {count1}/{count2}",
        ". ".repeat(level)
    );

    if checksum1 == checksum2 {
        node.set_is_diff(false);
        return Ok(None);
    }
    bisect_and_diff_segments(
        engine,
        table1,
        table2,
        node,
        level,
        Some(count1.max(count2)),
    )
    .await
}

/// Split a differing segment pair, or compare it locally when it is small
/// enough that bisection would cost more round trips than it saves.
fn bisect_and_diff_segments(
    engine: Arc<Engine>,
    table1: TableSegment,
    table2: TableSegment,
    node: Arc<InfoTree>,
    level: usize,
    max_rows: Option<u64>,
) -> BoxFuture<'static, TaskOutcome> {
    async move {
        debug_assert!(table1.is_bounded() && table2.is_bounded());

        let max_space = table1.approximate_size().max(table2.approximate_size());
        let max_rows = match max_rows {
            Some(rows) => rows,
            None => {
                // Without a count yet, the key-space size is the only bound;
                // they coincide iff the key is unique.
                node.set_max_rows(max_space);
                max_space
            }
        };

        let options = &engine.options;
        if options.bisection_disabled
            || max_rows < options.bisection_threshold
            || max_space < (options.bisection_factor as u64).saturating_mul(2)
        {
            return diff_segments_leaf(&engine, &table1, &table2, &node, level).await;
        }

        let (count1, count2) = futures::try_join!(table1.count(), table2.count())?;
        let biggest = if count2 > count1 { &table2 } else { &table1 };
        let factor = if options.auto_bisection_factor {
            let factor = calculate_bisection_factor(count1.max(count2), options.segment_rows);
            debug!("auto bisection factor for {max_rows} rows: {factor}");
            factor
        } else {
            options.bisection_factor
        };

        // Checkpoints come from the larger side and split both sides, so the
        // resulting segment pairs stay aligned.
        let checkpoints = biggest.choose_checkpoints(factor - 1);
        if checkpoints.is_empty() {
            return diff_segments_leaf(&engine, &table1, &table2, &node, level).await;
        }

        // Snapshot the ignored columns under the lock so every segment of
        // this split sees the same frozen view.
        let (ignored1, ignored2) = engine.ignored_snapshot();
        let table1 = table1.with_ignored_columns(ignored1);
        let table2 = table2.with_ignored_columns(ignored2);

        let segmented1 = table1.segment_by_checkpoints(&checkpoints);
        let segmented2 = table2.segment_by_checkpoints(&checkpoints);
        debug!(
            "{}splitting at level {level} into {} segment pairs",
            ". ".repeat(level),
            segmented1.len()
        );

        let segment_count = segmented1.len();
        for (index, (sub1, sub2)) in segmented1.into_iter().zip(segmented2).enumerate() {
            let child = node.add_node(&sub1, &sub2, Some(max_rows));
            engine.yielder.submit(
                level as u32,
                diff_segments(
                    engine.clone(),
                    sub1,
                    sub2,
                    child,
                    level + 1,
                    index + 1,
                    segment_count,
                ),
            );
        }
        Ok(None)
    }
    .boxed()
}

/// Download both sides of a leaf and set-diff them locally.
async fn diff_segments_leaf(
    engine: &Arc<Engine>,
    table1: &TableSegment,
    table2: &TableSegment,
    node: &Arc<InfoTree>,
    level: usize,
) -> TaskOutcome {
    let (rows1, rows2) = futures::try_join!(table1.get_values(), table2.get_values())?;
    {
        let mut stats = engine.stats.lock().unwrap();
        *stats.entry("rows_downloaded".into()).or_insert(0) += (rows1.len() + rows2.len()) as u64;
    }

    let json_columns = json_columns(table1);
    let (ignored1, ignored2) = engine.ignored_snapshot();
    let columns1 = table1.relevant_columns();
    let columns2 = table2.relevant_columns();
    let diff = rowdiff::diff_sets(
        &rows1,
        &rows2,
        &RowDiffParams {
            columns_a: &columns1,
            columns_b: &columns2,
            key_len: table1.key_columns().len(),
            ignored_a: &ignored1,
            ignored_b: &ignored2,
            json_columns: &json_columns,
        },
    );

    node.set_rowcounts([rows1.len() as u64, rows2.len() as u64]);
    node.set_diff(diff.clone());
    info!("{}diff found {} different rows", ". ".repeat(level), diff.len());
    Ok(Some(diff))
}

/// Positions of JSON-typed extra columns within a fetched row.
fn json_columns(segment: &TableSegment) -> HashMap<usize, String> {
    let Some(schema) = segment.schema() else {
        return HashMap::new();
    };
    let key_len = segment.key_columns().len();
    segment
        .extra_columns()
        .iter()
        .enumerate()
        .filter(|(_, name)| matches!(schema.get(name), Some(ColumnType::Json)))
        .map(|(index, name)| (key_len + index, name.clone()))
        .collect()
}

fn key_range_display(table1: &TableSegment, table2: &TableSegment) -> (String, String) {
    let min = table1
        .key_range()
        .map(|range| range.min().to_string())
        .unwrap_or_else(|| "start".into());
    let max = table2
        .key_range()
        .map(|range| range.max().to_string())
        .unwrap_or_else(|| "end".into());
    (min, max)
}

/// Reduce both schemas to mutual precision and validate the key columns.
fn reconcile_tables(
    table1: TableSegment,
    table2: TableSegment,
) -> Result<(TableSegment, TableSegment), DiffError> {
    let mut schema1 = table1
        .schema()
        .cloned()
        .ok_or_else(|| DiffError::Schema(format!("schema of {} was not queried", table1.name())))?;
    let mut schema2 = table2
        .schema()
        .cloned()
        .ok_or_else(|| DiffError::Schema(format!("schema of {} was not queried", table2.name())))?;
    schema::reconcile_schemas(
        &mut schema1,
        &mut schema2,
        &table1.relevant_columns(),
        &table2.relevant_columns(),
        table1.name(),
        table2.name(),
    )?;
    let table1 = table1.with_adjusted_schema(schema1);
    let table2 = table2.with_adjusted_schema(schema2);

    let keys1 = table1.key_column_types()?;
    let keys2 = table2.key_column_types()?;
    schema::validate_key_columns(&keys1, &keys2)?;
    Ok((table1, table2))
}

/// Factor derived from the row count: one child per `segment_rows`, at
/// least two.
fn calculate_bisection_factor(rows: u64, segment_rows: u64) -> usize {
    let ratio = rows as f64 / segment_rows.max(1) as f64;
    if ratio > 0.0 && ratio < 2.0 {
        2
    } else {
        (ratio.round() as usize).max(2)
    }
}
