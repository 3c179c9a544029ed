use std::cmp::Ordering;

use crate::engine::part::Part;

/// Number of distinct stencil directions: the 26 neighbour offsets folded
/// onto their positive representatives.
pub const NR_DIRECTIONS: usize = 13;

/// Unit axes of the 13 stencil directions, indexed by direction id. The
/// integer offsets are the canonical representatives of the folded stencil
/// (direction d and -d share an id; the canonical form has a positive
/// leading non-zero component in z-y-x significance order).
pub const AXES: [[f64; 3]; NR_DIRECTIONS] = [
    /* ( 1,  1,  1) */
    [0.5773502691896258, 0.5773502691896258, 0.5773502691896258],
    /* ( 0,  1,  1) */
    [0.0, 0.7071067811865475, 0.7071067811865475],
    /* (-1,  1,  1) */
    [-0.5773502691896258, 0.5773502691896258, 0.5773502691896258],
    /* ( 1,  0,  1) */
    [0.7071067811865475, 0.0, 0.7071067811865475],
    /* ( 0,  0,  1) */
    [0.0, 0.0, 1.0],
    /* (-1,  0,  1) */
    [-0.7071067811865475, 0.0, 0.7071067811865475],
    /* ( 1, -1,  1) */
    [0.5773502691896258, -0.5773502691896258, 0.5773502691896258],
    /* ( 0, -1,  1) */
    [0.0, -0.7071067811865475, 0.7071067811865475],
    /* (-1, -1,  1) */
    [-0.5773502691896258, -0.5773502691896258, 0.5773502691896258],
    /* ( 1,  1,  0) */
    [0.7071067811865475, 0.7071067811865475, 0.0],
    /* ( 0,  1,  0) */
    [0.0, 1.0, 0.0],
    /* (-1,  1,  0) */
    [-0.7071067811865475, 0.7071067811865475, 0.0],
    /* ( 1,  0,  0) */
    [1.0, 0.0, 0.0],
];

/// One slot of a per-cell directional sort: the projected distance along the
/// direction axis and the cell-local particle index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortEntry {
    pub d: f64,
    pub i: u32,
}

/// Entries are ordered by `(d, i)`: the index tie-break gives a
/// deterministic total order without ever comparing floats for equality.
#[inline]
pub fn entry_cmp(a: &SortEntry, b: &SortEntry) -> Ordering {
    a.d.partial_cmp(&b.d)
        .expect("projected distance is NaN")
        .then(a.i.cmp(&b.i))
}

#[inline]
pub fn project(x: &[f64; 3], sid: usize) -> f64 {
    let ax = &AXES[sid];
    x[0] * ax[0] + x[1] * ax[1] + x[2] * ax[2]
}

/// Sort a leaf cell's particles along one direction.
pub fn sort_leaf(parts: &[Part], sid: usize, out: &mut Vec<SortEntry>) {
    out.clear();
    out.extend(parts.iter().enumerate().map(|(i, p)| SortEntry {
        d: project(&[p.x[0], p.x[1], p.x[2]], sid),
        i: i as u32,
    }));
    out.sort_unstable_by(entry_cmp);
}

/// Merge the sorted streams of a split cell's progeny into the parent's
/// order. `children` pairs each progeny stream with the offset of that
/// child's particle range relative to the parent's, so entries are rebased
/// to parent-local indices.
pub fn merge_progeny(children: &[(&[SortEntry], usize)], out: &mut Vec<SortEntry>) {
    out.clear();
    let total: usize = children.iter().map(|(s, _)| s.len()).sum();
    out.reserve(total);

    let mut fingers = vec![0usize; children.len()];
    for _ in 0..total {
        let mut best: Option<(usize, SortEntry)> = None;
        for (k, (stream, rebase)) in children.iter().enumerate() {
            if fingers[k] >= stream.len() {
                continue;
            }
            let e = stream[fingers[k]];
            let rebased = SortEntry {
                d: e.d,
                i: e.i + *rebase as u32,
            };
            match &best {
                Some((_, b)) if entry_cmp(&rebased, b) != Ordering::Less => {}
                _ => best = Some((k, rebased)),
            }
        }
        let (k, e) = best.expect("merge ran dry before emitting all entries");
        fingers[k] += 1;
        out.push(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::vec3;

    #[test]
    fn leaf_sort_orders_by_projection() {
        let parts = vec![
            Part::new(0, vec3(0.9, 0.0, 0.0), 0.1),
            Part::new(1, vec3(0.1, 0.0, 0.0), 0.1),
            Part::new(2, vec3(0.5, 0.0, 0.0), 0.1),
        ];
        let mut out = Vec::new();
        sort_leaf(&parts, 12, &mut out);
        let order: Vec<u32> = out.iter().map(|e| e.i).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(out.windows(2).all(|w| w[0].d <= w[1].d));
    }

    #[test]
    fn equal_keys_fall_back_to_index_order() {
        // All at the same x: direction 12 projects them onto one point.
        let parts: Vec<Part> = (0..5)
            .map(|i| Part::new(i, vec3(0.5, i as f64 * 0.1, 0.0), 0.1))
            .collect();
        let mut out = Vec::new();
        sort_leaf(&parts, 12, &mut out);
        let order: Vec<u32> = out.iter().map(|e| e.i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn merge_matches_flat_sort() {
        // Two children, ranges [0, 3) and [3, 7) of the parent.
        let left = vec![
            SortEntry { d: 0.1, i: 0 },
            SortEntry { d: 0.4, i: 2 },
            SortEntry { d: 0.9, i: 1 },
        ];
        let right = vec![
            SortEntry { d: 0.2, i: 3 },
            SortEntry { d: 0.4, i: 0 },
            SortEntry { d: 0.5, i: 1 },
            SortEntry { d: 0.8, i: 2 },
        ];
        let mut out = Vec::new();
        merge_progeny(&[(&left, 0), (&right, 3)], &mut out);

        let mut flat: Vec<SortEntry> = left
            .iter()
            .copied()
            .chain(right.iter().map(|e| SortEntry {
                d: e.d,
                i: e.i + 3,
            }))
            .collect();
        flat.sort_unstable_by(entry_cmp);
        assert_eq!(out, flat);
    }
}
