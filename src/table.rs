// Copyright 2024 Developers of the tablediff project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The database-layer contract and the table segment value object.
//!
//! [`Datasource`] is everything the engine asks of the database layer: schema
//! discovery, key-range queries, counts, checksums, and row downloads. SQL
//! generation, drivers and connection pools live behind it.
//!
//! [`TableSegment`] is an immutable bounded rectangle of one table in
//! key-space. Derivations ([`new_key_bounds`](TableSegment::new_key_bounds),
//! [`with_ignored_columns`](TableSegment::with_ignored_columns)) produce new
//! instances; nothing mutates a segment after construction.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::DiffError;
use crate::key::{Key, KeyRange};
use crate::schema::{ColumnType, Schema};
use crate::value::Row;

/// The consumed database-layer contract.
///
/// All methods take the segment being queried, so one datasource instance can
/// serve every segment derived from its table. Checksums must be
/// order-independent over the segment's rows and deterministic for identical
/// row content across databases, given identical relevant columns.
#[async_trait]
pub trait Datasource: fmt::Debug + Send + Sync {
    /// Identity of the backing table, for logs and error messages.
    fn name(&self) -> &str;

    /// Column types for the requested columns.
    async fn schema(&self, columns: &[String]) -> Result<Schema, DiffError>;

    /// Observed per-column minimum and maximum of the segment's key columns,
    /// both inclusive, or `None` when the segment holds no rows.
    async fn query_key_range(&self, segment: &TableSegment)
        -> Result<Option<(Key, Key)>, DiffError>;

    /// Row count of the segment.
    async fn count(&self, segment: &TableSegment) -> Result<u64, DiffError>;

    /// Row count and order-independent checksum in a single round trip. The
    /// checksum covers the segment's non-ignored relevant columns.
    async fn count_and_checksum(&self, segment: &TableSegment) -> Result<(u64, u128), DiffError>;

    /// Download the segment's rows, each aligned with its relevant columns.
    async fn fetch_rows(&self, segment: &TableSegment) -> Result<Vec<Row>, DiffError>;

    /// Dialect flag: checksum concatenation can overflow on this database and
    /// needs the prevention mode enabled before checksums are queried.
    fn prevent_overflow_when_concat(&self) -> bool {
        false
    }

    /// Switch the dialect into its overflow-prevention mode.
    fn enable_preventing_type_overflow(&self) {}
}

/// A bounded rectangle of one table in key-space, plus the columns the diff
/// cares about.
#[derive(Clone, Debug)]
pub struct TableSegment {
    source: Arc<dyn Datasource>,
    key_columns: Vec<String>,
    extra_columns: Vec<String>,
    ignored_columns: BTreeSet<String>,
    key_range: Option<KeyRange>,
    schema: Option<Schema>,
    count_cache: Arc<OnceCell<u64>>,
}

impl TableSegment {
    pub fn new(
        source: Arc<dyn Datasource>,
        key_columns: Vec<String>,
        extra_columns: Vec<String>,
    ) -> TableSegment {
        TableSegment {
            source,
            key_columns,
            extra_columns,
            ignored_columns: BTreeSet::new(),
            key_range: None,
            schema: None,
            count_cache: Arc::new(OnceCell::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn source(&self) -> &Arc<dyn Datasource> {
        &self.source
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    /// Key columns followed by the extra columns; the layout of fetched rows.
    pub fn relevant_columns(&self) -> Vec<String> {
        self.key_columns
            .iter()
            .chain(&self.extra_columns)
            .cloned()
            .collect()
    }

    /// Relevant columns minus the ignored ones; what checksums cover. Key
    /// columns are never dropped.
    pub fn checksum_columns(&self) -> Vec<String> {
        self.key_columns
            .iter()
            .cloned()
            .chain(
                self.extra_columns
                    .iter()
                    .filter(|c| !self.ignored_columns.contains(*c))
                    .cloned(),
            )
            .collect()
    }

    pub fn ignored_columns(&self) -> &BTreeSet<String> {
        &self.ignored_columns
    }

    pub fn key_range(&self) -> Option<&KeyRange> {
        self.key_range.as_ref()
    }

    pub fn is_bounded(&self) -> bool {
        self.key_range.is_some()
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// `(name, type)` pairs for the key columns, from the queried schema.
    pub fn key_column_types(&self) -> Result<Vec<(String, ColumnType)>, DiffError> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| DiffError::Schema(format!("schema of {} was not queried", self.name())))?;
        self.key_columns
            .iter()
            .map(|name| {
                schema
                    .get(name)
                    .cloned()
                    .map(|ty| (name.clone(), ty))
                    .ok_or_else(|| {
                        DiffError::Schema(format!(
                            "key column '{name}' not found in schema for table {}",
                            self.name()
                        ))
                    })
            })
            .collect()
    }

    /// Query and attach the schema for the relevant columns. A segment that
    /// already carries a schema is returned unchanged.
    pub async fn with_schema(self) -> Result<TableSegment, DiffError> {
        if self.schema.is_some() {
            return Ok(self);
        }
        let schema = self.source.schema(&self.relevant_columns()).await?;
        Ok(TableSegment {
            schema: Some(schema),
            ..self
        })
    }

    /// Replace the schema with a reconciled copy.
    pub(crate) fn with_adjusted_schema(self, schema: Schema) -> TableSegment {
        TableSegment {
            schema: Some(schema),
            ..self
        }
    }

    /// Observed key range of this segment, adjusted to the half-open
    /// convention: the maximum is the successor of the largest observed key
    /// in every component. `None` when the segment holds no rows.
    pub async fn query_key_range(&self) -> Result<Option<KeyRange>, DiffError> {
        let observed = self.source.query_key_range(self).await?;
        Ok(observed.map(|(min, max)| KeyRange::new(min, max.successor())))
    }

    /// Row count, queried once per segment instance and cached.
    pub async fn count(&self) -> Result<u64, DiffError> {
        self.count_cache
            .get_or_try_init(|| self.source.count(self))
            .await
            .copied()
    }

    /// Row count and checksum in one round trip.
    pub async fn count_and_checksum(&self) -> Result<(u64, u128), DiffError> {
        self.source.count_and_checksum(self).await
    }

    /// Download all rows of this segment.
    pub async fn get_values(&self) -> Result<Vec<Row>, DiffError> {
        self.source.fetch_rows(self).await
    }

    /// Derive a segment bounded by the given range. The count cache starts
    /// fresh; columns and schema carry over.
    pub fn new_key_bounds(&self, range: KeyRange) -> TableSegment {
        TableSegment {
            source: self.source.clone(),
            key_columns: self.key_columns.clone(),
            extra_columns: self.extra_columns.clone(),
            ignored_columns: self.ignored_columns.clone(),
            key_range: Some(range),
            schema: self.schema.clone(),
            count_cache: Arc::new(OnceCell::new()),
        }
    }

    /// Derive a segment with a frozen ignored-columns snapshot.
    pub fn with_ignored_columns(&self, ignored_columns: BTreeSet<String>) -> TableSegment {
        TableSegment {
            source: self.source.clone(),
            key_columns: self.key_columns.clone(),
            extra_columns: self.extra_columns.clone(),
            ignored_columns,
            key_range: self.key_range.clone(),
            schema: self.schema.clone(),
            count_cache: self.count_cache.clone(),
        }
    }

    /// Up to `count` interior split keys for this segment's range; empty when
    /// the segment is unbounded or too narrow to split.
    pub fn choose_checkpoints(&self, count: usize) -> Vec<Key> {
        match &self.key_range {
            Some(range) => range.choose_checkpoints(count),
            None => Vec::new(),
        }
    }

    /// Split into `checkpoints.len() + 1` contiguous sub-segments covering
    /// the same range.
    pub fn segment_by_checkpoints(&self, checkpoints: &[Key]) -> Vec<TableSegment> {
        match &self.key_range {
            Some(range) => range
                .split_at(checkpoints)
                .into_iter()
                .map(|sub| self.new_key_bounds(sub))
                .collect(),
            None => vec![self.clone()],
        }
    }

    /// Cheap upper bound on this segment's row count, derived from the key
    /// range alone.
    pub fn approximate_size(&self) -> u64 {
        self.key_range
            .as_ref()
            .map_or(u64::MAX, KeyRange::approximate_size)
    }
}

impl fmt::Display for TableSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key_range {
            Some(range) => write!(f, "{}[{range}]", self.name()),
            None => write!(f, "{}[unbounded]", self.name()),
        }
    }
}
