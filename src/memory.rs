//! In-memory reference datasource.
//!
//! Backs the tests and the demo binary. Rows are stored in insertion order in
//! their physical column layout; every query filters by the segment's key
//! rectangle and projects onto the segment's columns, normalizing values the
//! way a SQL dialect would before checksumming or returning them.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::DiffError;
use crate::key::{Key, KeyValue};
use crate::schema::{ColumnType, Schema};
use crate::table::{Datasource, TableSegment};
use crate::value::{self, Row, Value};

#[derive(Debug)]
pub struct InMemoryTable {
    name: String,
    columns: Vec<(String, ColumnType)>,
    rows: RwLock<Vec<Row>>,
}

impl InMemoryTable {
    pub fn new(name: impl Into<String>, columns: Vec<(&str, ColumnType)>) -> InMemoryTable {
        InMemoryTable {
            name: name.into(),
            columns: columns
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty))
                .collect(),
            rows: RwLock::new(Vec::new()),
        }
    }

    /// Append rows in the physical column layout passed to [`new`](Self::new).
    pub fn insert_rows(&self, rows: impl IntoIterator<Item = Row>) {
        self.rows.write().unwrap().extend(rows);
    }

    /// An unbounded segment over this table.
    pub fn segment(self: &Arc<Self>, key_columns: &[&str], extra_columns: &[&str]) -> TableSegment {
        TableSegment::new(
            self.clone() as Arc<dyn Datasource>,
            key_columns.iter().map(|c| c.to_string()).collect(),
            extra_columns.iter().map(|c| c.to_string()).collect(),
        )
    }

    fn position(&self, column: &str) -> Result<usize, DiffError> {
        self.columns
            .iter()
            .position(|(name, _)| name == column)
            .ok_or_else(|| {
                DiffError::Schema(format!(
                    "column '{column}' not found in table {}",
                    self.name
                ))
            })
    }

    fn positions(&self, columns: &[String]) -> Result<Vec<usize>, DiffError> {
        columns.iter().map(|c| self.position(c)).collect()
    }

    fn column_type<'a>(&'a self, segment: &'a TableSegment, column: &str) -> Option<&'a ColumnType> {
        segment
            .schema()
            .and_then(|s| s.get(column))
            .or_else(|| self.columns.iter().find(|(name, _)| name == column).map(|(_, ty)| ty))
    }

    fn row_key(&self, row: &Row, key_positions: &[usize]) -> Result<Key, DiffError> {
        let parts: Result<Vec<KeyValue>, DiffError> = key_positions
            .iter()
            .map(|&i| {
                value::to_key_value(&row[i]).ok_or_else(|| {
                    DiffError::Schema(format!(
                        "table {}: value in key position {i} is not key-eligible",
                        self.name
                    ))
                })
            })
            .collect();
        Ok(Key::new(parts?))
    }

    /// Rows inside the segment's rectangle, in storage order.
    fn rows_in_segment(&self, segment: &TableSegment) -> Result<Vec<Row>, DiffError> {
        let key_positions = self.positions(segment.key_columns())?;
        let rows = self.rows.read().unwrap();
        let mut selected = Vec::new();
        for row in rows.iter() {
            let key = self.row_key(row, &key_positions)?;
            let keep = match segment.key_range() {
                Some(range) => range.contains(&key),
                None => true,
            };
            if keep {
                selected.push(row.clone());
            }
        }
        Ok(selected)
    }

    fn project_normalized(
        &self,
        segment: &TableSegment,
        row: &Row,
        columns: &[String],
        positions: &[usize],
    ) -> Row {
        columns
            .iter()
            .zip(positions)
            .map(|(name, &i)| match self.column_type(segment, name) {
                Some(ty) => value::normalize_value(&row[i], ty),
                None => row[i].clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Datasource for InMemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn schema(&self, columns: &[String]) -> Result<Schema, DiffError> {
        let requested: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        Ok(Schema::new(self.columns.iter().filter_map(|(name, ty)| {
            requested
                .contains(name.as_str())
                .then(|| (name.clone(), ty.clone()))
        })))
    }

    async fn query_key_range(
        &self,
        segment: &TableSegment,
    ) -> Result<Option<(Key, Key)>, DiffError> {
        let key_positions = self.positions(segment.key_columns())?;
        let rows = self.rows_in_segment(segment)?;
        if rows.is_empty() {
            return Ok(None);
        }
        // Per-column min/max, the way `SELECT MIN(k), MAX(k)` reports them.
        let mut mins: Option<Vec<KeyValue>> = None;
        let mut maxes: Option<Vec<KeyValue>> = None;
        for row in &rows {
            let key = self.row_key(row, &key_positions)?;
            match (&mut mins, &mut maxes) {
                (Some(mins), Some(maxes)) => {
                    for (i, part) in key.iter().enumerate() {
                        if *part < mins[i] {
                            mins[i] = part.clone();
                        }
                        if *part > maxes[i] {
                            maxes[i] = part.clone();
                        }
                    }
                }
                _ => {
                    mins = Some(key.iter().cloned().collect());
                    maxes = Some(key.iter().cloned().collect());
                }
            }
        }
        Ok(mins
            .zip(maxes)
            .map(|(mins, maxes)| (Key::new(mins), Key::new(maxes))))
    }

    async fn count(&self, segment: &TableSegment) -> Result<u64, DiffError> {
        Ok(self.rows_in_segment(segment)?.len() as u64)
    }

    async fn count_and_checksum(&self, segment: &TableSegment) -> Result<(u64, u128), DiffError> {
        let columns = segment.checksum_columns();
        let positions = self.positions(&columns)?;
        let rows = self.rows_in_segment(segment)?;
        let mut checksum = 0u128;
        for row in &rows {
            let fields = columns.iter().zip(&positions).map(|(name, &i)| {
                let ty = self.column_type(segment, name);
                let normalized = match ty {
                    Some(ty) => value::normalize_value(&row[i], ty),
                    None => row[i].clone(),
                };
                value::canonical_text(&normalized, ty)
            });
            checksum = value::combine_checksum(checksum, value::row_digest(fields.collect::<Vec<_>>()));
        }
        Ok((rows.len() as u64, checksum))
    }

    async fn fetch_rows(&self, segment: &TableSegment) -> Result<Vec<Row>, DiffError> {
        let columns = segment.relevant_columns();
        let positions = self.positions(&columns)?;
        Ok(self
            .rows_in_segment(segment)?
            .iter()
            .map(|row| self.project_normalized(segment, row, &columns, &positions))
            .collect())
    }
}
