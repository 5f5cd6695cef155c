// Copyright 2024 Developers of the tablediff project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Compound keys and half-open key ranges.
//!
//! A [`Key`] is an ordered tuple of column values compared lexicographically.
//! A [`KeyRange`] is a half-open rectangle in key-space: every component of
//! `max` is one past the largest observed value in that component.
//!
//! Key values map into an unsigned ordinal space per component, which is what
//! checkpoint selection and size estimation do their arithmetic in.

use std::fmt;

use arrayvec::ArrayVec;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Maximum number of columns in a compound key.
pub const MAX_KEY_PARTS: usize = 8;

/// Number of leading characters that participate in text-key arithmetic.
/// 128^18 fits in a u128 with room to spare.
const TEXT_ORDINAL_CHARS: usize = 18;

/// Semantic kind of a key column. Corresponding key columns on the two sides
/// must agree exactly; "compatible" is not good enough.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum KeyKind {
    Int,
    Timestamp,
    Uuid,
    Text,
}

/// A single component of a compound key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum KeyValue {
    Int(i64),
    Timestamp(DateTime<Utc>),
    Uuid(u128),
    Text(String),
}

impl KeyValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyValue::Int(_) => KeyKind::Int,
            KeyValue::Timestamp(_) => KeyKind::Timestamp,
            KeyValue::Uuid(_) => KeyKind::Uuid,
            KeyValue::Text(_) => KeyKind::Text,
        }
    }

    /// The smallest value strictly greater than `self`.
    ///
    /// Used to turn an observed (inclusive) maximum into the exclusive bound
    /// of a half-open range.
    pub fn successor(&self) -> KeyValue {
        match self {
            KeyValue::Int(v) => KeyValue::Int(v.saturating_add(1)),
            KeyValue::Timestamp(t) => KeyValue::Timestamp(*t + Duration::microseconds(1)),
            KeyValue::Uuid(v) => KeyValue::Uuid(v.wrapping_add(1)),
            KeyValue::Text(s) => {
                let mut next = s.clone();
                next.push('\u{0}');
                KeyValue::Text(next)
            }
        }
    }

    /// Map into the unsigned ordinal space of this value's kind.
    ///
    /// Ordinals order the same way the values do, except that text values are
    /// compared on their first [`TEXT_ORDINAL_CHARS`] characters only, which
    /// is good enough for approximate checkpoint placement.
    pub fn to_ordinal(&self) -> u128 {
        match self {
            KeyValue::Int(v) => (*v as i128 - i64::MIN as i128) as u128,
            KeyValue::Timestamp(t) => (t.timestamp_micros() as i128 - i64::MIN as i128) as u128,
            KeyValue::Uuid(v) => *v,
            KeyValue::Text(s) => {
                let bytes = s.as_bytes();
                let mut ordinal = 0u128;
                for i in 0..TEXT_ORDINAL_CHARS {
                    let digit = bytes.get(i).map(|b| u128::from((*b).min(0x7f))).unwrap_or(0);
                    ordinal = ordinal * 128 + digit;
                }
                ordinal
            }
        }
    }

    /// Inverse of [`to_ordinal`](Self::to_ordinal) for ordinals lying between
    /// two valid values of the given kind.
    pub fn from_ordinal(kind: KeyKind, ordinal: u128) -> KeyValue {
        match kind {
            KeyKind::Int => KeyValue::Int((ordinal as i128 + i64::MIN as i128) as i64),
            KeyKind::Timestamp => {
                let micros = (ordinal as i128 + i64::MIN as i128) as i64;
                KeyValue::Timestamp(
                    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC),
                )
            }
            KeyKind::Uuid => KeyValue::Uuid(ordinal),
            KeyKind::Text => {
                let mut digits = [0u8; TEXT_ORDINAL_CHARS];
                let mut rest = ordinal;
                for slot in digits.iter_mut().rev() {
                    *slot = (rest % 128) as u8;
                    rest /= 128;
                }
                let len = digits.iter().rposition(|d| *d != 0).map_or(0, |p| p + 1);
                // digits are always ASCII
                let text = String::from_utf8(digits[..len].to_vec()).unwrap_or_default();
                KeyValue::Text(text)
            }
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%d %H:%M:%S%.6f")),
            KeyValue::Uuid(v) => write!(f, "{v:032x}"),
            KeyValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A compound key: an ordered tuple of [`KeyValue`]s, compared
/// lexicographically. Arity is validated against [`MAX_KEY_PARTS`] before any
/// key is built.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Key(ArrayVec<KeyValue, MAX_KEY_PARTS>);

impl Key {
    pub fn new(parts: impl IntoIterator<Item = KeyValue>) -> Key {
        Key(parts.into_iter().collect())
    }

    pub fn single(part: KeyValue) -> Key {
        Key::new([part])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Component-wise successor; see [`KeyValue::successor`].
    pub fn successor(&self) -> Key {
        Key::new(self.0.iter().map(KeyValue::successor))
    }

    /// `self[i] < other[i]` in every component.
    pub fn each_lt(&self, other: &Key) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a < b)
    }

    /// `self[i] <= other[i]` in every component.
    pub fn each_le(&self, other: &Key) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a <= b)
    }

    /// A copy of this key with one component replaced.
    pub fn replace(&self, index: usize, value: KeyValue) -> Key {
        let mut parts = self.0.clone();
        parts[index] = value;
        Key(parts)
    }
}

impl std::ops::Index<usize> for Key {
    type Output = KeyValue;

    fn index(&self, index: usize) -> &KeyValue {
        &self.0[index]
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// A half-open rectangle `[min, max)` in compound-key space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyRange {
    min: Key,
    max: Key,
}

impl KeyRange {
    pub fn new(min: Key, max: Key) -> KeyRange {
        debug_assert_eq!(min.len(), max.len());
        KeyRange { min, max }
    }

    pub fn min(&self) -> &Key {
        &self.min
    }

    pub fn max(&self) -> &Key {
        &self.max
    }

    pub fn dimensions(&self) -> usize {
        self.min.len()
    }

    /// Component-wise membership: `min[i] <= key[i] < max[i]` for every `i`.
    pub fn contains(&self, key: &Key) -> bool {
        self.min.each_le(key) && key.each_lt(&self.max)
    }

    /// True when `other` lies entirely inside this rectangle.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.min.each_le(&other.min) && other.max.each_le(&self.max)
    }

    pub fn is_degenerate(&self) -> bool {
        !self.min.each_lt(&self.max)
    }

    /// Cheap upper bound on the number of keys in the rectangle: the product
    /// of the per-component ordinal spans, saturating at `u64::MAX`.
    pub fn approximate_size(&self) -> u64 {
        let mut size: u128 = 1;
        for (mn, mx) in self.min.iter().zip(self.max.iter()) {
            let span = mx.to_ordinal().saturating_sub(mn.to_ordinal());
            size = size.saturating_mul(span);
            if size >= u64::MAX as u128 {
                return u64::MAX;
            }
        }
        size as u64
    }

    /// First dimension wide enough to be split, if any.
    fn split_dimension(&self) -> Option<usize> {
        self.min
            .iter()
            .zip(self.max.iter())
            .position(|(mn, mx)| mx.to_ordinal().saturating_sub(mn.to_ordinal()) >= 2)
    }

    /// Up to `count` interior split keys, approximately evenly spaced,
    /// strictly increasing, deduplicated. Empty when the range cannot be
    /// split any further.
    pub fn choose_checkpoints(&self, count: usize) -> Vec<Key> {
        let Some(dim) = self.split_dimension() else {
            return Vec::new();
        };
        let kind = self.min[dim].kind();
        let lo = self.min[dim].to_ordinal();
        let hi = self.max[dim].to_ordinal();
        let step = ((hi - lo) / (count as u128 + 1)).max(1);
        let mut checkpoints = Vec::with_capacity(count);
        for i in 1..=count as u128 {
            let ordinal = lo.saturating_add(step.saturating_mul(i));
            if ordinal <= lo || ordinal >= hi {
                break;
            }
            checkpoints.push(self.min.replace(dim, KeyValue::from_ordinal(kind, ordinal)));
        }
        checkpoints
    }

    /// Split into `checkpoints.len() + 1` contiguous sub-rectangles covering
    /// exactly this range. The checkpoints must come from
    /// [`choose_checkpoints`](Self::choose_checkpoints) on the same range.
    pub fn split_at(&self, checkpoints: &[Key]) -> Vec<KeyRange> {
        if checkpoints.is_empty() {
            return vec![self.clone()];
        }
        // The checkpoints vary in exactly one dimension.
        let dim = self
            .min
            .iter()
            .zip(checkpoints[0].iter())
            .position(|(a, b)| a != b)
            .unwrap_or(0);
        let mut bounds = Vec::with_capacity(checkpoints.len() + 2);
        bounds.push(self.min[dim].clone());
        for checkpoint in checkpoints {
            bounds.push(checkpoint[dim].clone());
        }
        bounds.push(self.max[dim].clone());
        bounds
            .windows(2)
            .map(|pair| {
                KeyRange::new(
                    self.min.replace(dim, pair[0].clone()),
                    self.max.replace(dim, pair[1].clone()),
                )
            })
            .collect()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(parts: &[i64]) -> Key {
        Key::new(parts.iter().map(|v| KeyValue::Int(*v)))
    }

    #[test]
    fn ordinal_roundtrip_int() {
        for v in [i64::MIN, -1, 0, 1, 42, i64::MAX] {
            let value = KeyValue::Int(v);
            let back = KeyValue::from_ordinal(KeyKind::Int, value.to_ordinal());
            assert_eq!(back, value);
        }
    }

    #[test]
    fn ordinal_orders_like_values() {
        let a = KeyValue::Int(-5);
        let b = KeyValue::Int(17);
        assert!(a.to_ordinal() < b.to_ordinal());

        let a = KeyValue::Text("apple".into());
        let b = KeyValue::Text("banana".into());
        assert!(a.to_ordinal() < b.to_ordinal());
    }

    #[test]
    fn text_ordinal_roundtrip() {
        let value = KeyValue::Text("user_0042".into());
        let back = KeyValue::from_ordinal(KeyKind::Text, value.to_ordinal());
        assert_eq!(back, value);
    }

    #[test]
    fn successor_is_strictly_greater() {
        for value in [
            KeyValue::Int(7),
            KeyValue::Uuid(99),
            KeyValue::Text("abc".into()),
            KeyValue::Timestamp(DateTime::from_timestamp_micros(1_000_000).unwrap()),
        ] {
            assert!(value.successor() > value);
        }
    }

    #[test]
    fn range_contains_is_component_wise() {
        let range = KeyRange::new(int_key(&[0, 10]), int_key(&[5, 20]));
        assert!(range.contains(&int_key(&[0, 10])));
        assert!(range.contains(&int_key(&[4, 19])));
        assert!(!range.contains(&int_key(&[5, 15])));
        assert!(!range.contains(&int_key(&[3, 9])));
        assert!(!range.contains(&int_key(&[3, 20])));
    }

    #[test]
    fn checkpoints_are_interior_increasing_and_deduped() {
        let range = KeyRange::new(int_key(&[0]), int_key(&[100]));
        let checkpoints = range.choose_checkpoints(3);
        assert_eq!(checkpoints.len(), 3);
        for pair in checkpoints.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for checkpoint in &checkpoints {
            assert!(range.contains(checkpoint));
        }
    }

    #[test]
    fn checkpoints_shrink_in_tight_ranges() {
        let range = KeyRange::new(int_key(&[0]), int_key(&[3]));
        let checkpoints = range.choose_checkpoints(7);
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0], int_key(&[1]));
        assert_eq!(checkpoints[1], int_key(&[2]));

        let range = KeyRange::new(int_key(&[0]), int_key(&[1]));
        assert!(range.choose_checkpoints(3).is_empty());
    }

    #[test]
    fn split_partitions_the_range() {
        let range = KeyRange::new(int_key(&[0, 0]), int_key(&[100, 10]));
        let checkpoints = range.choose_checkpoints(3);
        let parts = range.split_at(&checkpoints);
        assert_eq!(parts.len(), checkpoints.len() + 1);

        // Every key in the range lands in exactly one part.
        for a in [0i64, 24, 25, 49, 99] {
            for b in [0i64, 5, 9] {
                let key = int_key(&[a, b]);
                assert!(range.contains(&key));
                let hits = parts.iter().filter(|p| p.contains(&key)).count();
                assert_eq!(hits, 1, "key {key} covered {hits} times");
            }
        }
        assert!(!parts.iter().any(|p| p.contains(&int_key(&[100, 0]))));
    }

    #[test]
    fn split_uses_second_dimension_when_first_is_flat() {
        let range = KeyRange::new(int_key(&[7, 0]), int_key(&[8, 100]));
        let checkpoints = range.choose_checkpoints(3);
        assert_eq!(checkpoints.len(), 3);
        let parts = range.split_at(&checkpoints);
        assert_eq!(parts.len(), 4);
        let covered: u64 = parts.iter().map(|p| p.approximate_size()).sum();
        assert_eq!(covered, range.approximate_size());
    }

    #[test]
    fn approximate_size_is_a_span_product() {
        let range = KeyRange::new(int_key(&[0, 0]), int_key(&[10, 5]));
        assert_eq!(range.approximate_size(), 50);

        let degenerate = KeyRange::new(int_key(&[3, 0]), int_key(&[3, 5]));
        assert_eq!(degenerate.approximate_size(), 0);

        let huge = KeyRange::new(
            Key::single(KeyValue::Uuid(0)),
            Key::single(KeyValue::Uuid(u128::MAX)),
        );
        assert_eq!(huge.approximate_size(), u64::MAX);
    }
}
