//! Union-cover mesh over two compound-key ranges.
//!
//! When the two tables' observed key ranges disagree, the space outside the
//! first-observed range still has to be diffed. Sorting the four boundary
//! values of each dimension and taking the cartesian product of the resulting
//! three intervals yields `3ⁿ` aligned boxes that cover the union of both
//! ranges; dropping the degenerate ones and those already inside the primary
//! range leaves at most `3ⁿ - 1` second-pass boxes.

use crate::key::{Key, KeyRange, KeyValue};

/// Build the `3ⁿ` aligned boxes spanned by per-dimension boundary quadruples.
///
/// Each entry of `points` holds the four sorted boundary values of one key
/// dimension; consecutive values form three half-open intervals.
pub fn create_mesh_from_points(points: &[[KeyValue; 4]]) -> Vec<(Key, Key)> {
    let mut boxes: Vec<(Vec<KeyValue>, Vec<KeyValue>)> = vec![(Vec::new(), Vec::new())];
    for quad in points {
        let mut extended = Vec::with_capacity(boxes.len() * 3);
        for (mins, maxes) in &boxes {
            for window in quad.windows(2) {
                let mut mins = mins.clone();
                let mut maxes = maxes.clone();
                mins.push(window[0].clone());
                maxes.push(window[1].clone());
                extended.push((mins, maxes));
            }
        }
        boxes = extended;
    }
    boxes
        .into_iter()
        .map(|(mins, maxes)| (Key::new(mins), Key::new(maxes)))
        .collect()
}

/// Keep the boxes that still need diffing: non-degenerate and not entirely
/// contained in the primary (first-observed) range.
pub fn uncovered_boxes(mesh: Vec<(Key, Key)>, primary: &KeyRange) -> Vec<KeyRange> {
    mesh.into_iter()
        .filter(|(lower, upper)| lower.each_lt(upper))
        .map(|(lower, upper)| KeyRange::new(lower, upper))
        .filter(|candidate| !primary.contains_range(candidate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn quad(values: [i64; 4]) -> [KeyValue; 4] {
        let mut sorted = values;
        sorted.sort_unstable();
        sorted.map(KeyValue::Int)
    }

    fn int_key(parts: &[i64]) -> Key {
        Key::new(parts.iter().map(|v| KeyValue::Int(*v)))
    }

    #[test]
    fn one_dimension_yields_three_boxes() {
        let mesh = create_mesh_from_points(&[quad([0, 5, 10, 20])]);
        assert_eq!(mesh.len(), 3);
        assert_eq!(mesh[0], (int_key(&[0]), int_key(&[5])));
        assert_eq!(mesh[1], (int_key(&[5]), int_key(&[10])));
        assert_eq!(mesh[2], (int_key(&[10]), int_key(&[20])));
    }

    #[test]
    fn two_dimensions_yield_nine_boxes() {
        let mesh = create_mesh_from_points(&[quad([0, 2, 4, 6]), quad([0, 3, 6, 9])]);
        assert_eq!(mesh.len(), 9);
    }

    #[test]
    fn identical_ranges_leave_no_second_pass_boxes() {
        let primary = KeyRange::new(int_key(&[0]), int_key(&[10]));
        let mesh = create_mesh_from_points(&[quad([0, 0, 10, 10])]);
        assert!(uncovered_boxes(mesh, &primary).is_empty());
    }

    #[test]
    fn mesh_covers_both_ranges() {
        // For any two 2-D ranges, the primary box plus the uncovered boxes
        // together cover every key lying in either range.
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut bounds = || {
                let a: i64 = rng.gen_range(0..50);
                let b: i64 = rng.gen_range(0..50);
                (a.min(b), a.max(b) + 1)
            };
            let (mn1a, mx1a) = bounds();
            let (mn1b, mx1b) = bounds();
            let (mn2a, mx2a) = bounds();
            let (mn2b, mx2b) = bounds();
            let first = KeyRange::new(int_key(&[mn1a, mn1b]), int_key(&[mx1a, mx1b]));
            let second = KeyRange::new(int_key(&[mn2a, mn2b]), int_key(&[mx2a, mx2b]));

            let points = [
                quad([mn1a, mn2a, mx1a, mx2a]),
                quad([mn1b, mn2b, mx1b, mx2b]),
            ];
            let extra = uncovered_boxes(create_mesh_from_points(&points), &first);

            for a in 0..51 {
                for b in 0..51 {
                    let key = int_key(&[a, b]);
                    if first.contains(&key) || second.contains(&key) {
                        let covered =
                            first.contains(&key) || extra.iter().any(|r| r.contains(&key));
                        assert!(covered, "key {key} escaped the mesh");
                    }
                }
            }
        }
    }
}
