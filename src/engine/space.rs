use tracing::debug;

use crate::engine::cell::{partition_octants, CellArena};
use crate::engine::concurrency::{maybe_join, par_iter_mut1};
use crate::engine::params::SpaceParams;
use crate::engine::part::{CPart, Part};
use crate::engine::task::{add_unlock, rm_unlock, rm_unlock_blind, Task, TaskSubtype, TaskType};
use crate::engine::{vec3, CellId, TaskId, V3};

/// Task arena capacity per live cell. Holds for the full graph: sorts,
/// selves, pairs, subs, ghosts and force twins all counted.
const TASKS_PER_CELL: usize = 43;

/// Below this slice length the particle bin sort switches to insertion sort.
const SORT_INSERTION_CUTOFF: usize = 16;

/// Partition length from which the two bin-sort recursion branches are
/// handed to independent workers.
const SORT_PARALLEL_CUTOFF: usize = 100;

/// Map a relative cell displacement `(dx, dy, dz)`, encoded as
/// `9*(dz+1) + 3*(dy+1) + (dx+1)`, to its stencil direction id. Direction d
/// and -d fold onto the same id; the centre entry is unused.
pub const SORTLIST_ID: [usize; 27] = [
    /* ( -1 , -1 , -1 ) */ 0,
    /* (  0 , -1 , -1 ) */ 1,
    /* (  1 , -1 , -1 ) */ 2,
    /* ( -1 ,  0 , -1 ) */ 3,
    /* (  0 ,  0 , -1 ) */ 4,
    /* (  1 ,  0 , -1 ) */ 5,
    /* ( -1 ,  1 , -1 ) */ 6,
    /* (  0 ,  1 , -1 ) */ 7,
    /* (  1 ,  1 , -1 ) */ 8,
    /* ( -1 , -1 ,  0 ) */ 9,
    /* (  0 , -1 ,  0 ) */ 10,
    /* (  1 , -1 ,  0 ) */ 11,
    /* ( -1 ,  0 ,  0 ) */ 12,
    /* (  0 ,  0 ,  0 ) */ 0,
    /* (  1 ,  0 ,  0 ) */ 12,
    /* ( -1 ,  1 ,  0 ) */ 11,
    /* (  0 ,  1 ,  0 ) */ 10,
    /* (  1 ,  1 ,  0 ) */ 9,
    /* ( -1 , -1 ,  1 ) */ 8,
    /* (  0 , -1 ,  1 ) */ 7,
    /* (  1 , -1 ,  1 ) */ 6,
    /* ( -1 ,  0 ,  1 ) */ 5,
    /* (  0 ,  0 ,  1 ) */ 4,
    /* (  1 ,  0 ,  1 ) */ 3,
    /* ( -1 ,  1 ,  1 ) */ 2,
    /* (  0 ,  1 ,  1 ) */ 1,
    /* (  1 ,  1 ,  1 ) */ 0,
];

/// Direction id for the pair of progeny `(j, k)` of one split cell,
/// `j < k`. Octant bits: x = 4, y = 2, z = 1.
pub(crate) const PTS: [[i32; 8]; 7] = [
    [-1, 4, 10, 1, 12, 3, 9, 0],
    [-1, -1, 7, 10, 5, 12, 8, 9],
    [-1, -1, -1, 4, 11, 6, 12, 3],
    [-1, -1, -1, -1, 2, 11, 5, 12],
    [-1, -1, -1, -1, -1, 4, 10, 1],
    [-1, -1, -1, -1, -1, -1, 7, 10],
    [-1, -1, -1, -1, -1, -1, -1, 4],
];

/// Child-pair decomposition of a pair task per stencil direction: for a
/// pair `(ci, cj)` with direction `sid`, the progeny pairs
/// `(ci.progeny[i], cj.progeny[j])` that can still interact, each with its
/// own direction id. Corner directions ({0, 2, 6, 8}) have a single pair,
/// edges four, faces sixteen. Shared by build-time task refinement and the
/// runtime sub-task recursion.
pub(crate) const PAIR_SPLIT: [&[(usize, usize, usize)]; 13] = [
    /* sid  0, ( 1,  1,  1) */
    &[(7, 0, 0)],
    /* sid  1, ( 0,  1,  1) */
    &[(3, 0, 1), (7, 4, 1), (3, 4, 0), (7, 0, 2)],
    /* sid  2, (-1,  1,  1) */
    &[(3, 4, 2)],
    /* sid  3, ( 1,  0,  1) */
    &[(5, 0, 3), (7, 2, 3), (5, 2, 0), (7, 0, 6)],
    /* sid  4, ( 0,  0,  1) */
    &[
        (1, 0, 4),
        (3, 0, 7),
        (5, 0, 5),
        (7, 0, 8),
        (1, 2, 1),
        (3, 2, 4),
        (5, 2, 2),
        (7, 2, 5),
        (1, 4, 3),
        (3, 4, 6),
        (5, 4, 4),
        (7, 4, 7),
        (1, 6, 0),
        (3, 6, 3),
        (5, 6, 1),
        (7, 6, 4),
    ],
    /* sid  5, (-1,  0,  1) */
    &[(1, 4, 5), (3, 6, 5), (3, 4, 8), (1, 6, 2)],
    /* sid  6, ( 1, -1,  1) */
    &[(5, 2, 6)],
    /* sid  7, ( 0, -1,  1) */
    &[(1, 2, 7), (5, 6, 7), (5, 2, 8), (1, 6, 6)],
    /* sid  8, (-1, -1,  1) */
    &[(1, 6, 8)],
    /* sid  9, ( 1,  1,  0) */
    &[(6, 0, 9), (7, 1, 9), (6, 1, 0), (7, 0, 8)],
    /* sid 10, ( 0,  1,  0) */
    &[
        (2, 0, 10),
        (3, 0, 7),
        (6, 0, 11),
        (7, 0, 6),
        (2, 1, 1),
        (3, 1, 10),
        (6, 1, 2),
        (7, 1, 11),
        (2, 4, 9),
        (3, 4, 8),
        (6, 4, 10),
        (7, 4, 7),
        (2, 5, 0),
        (3, 5, 9),
        (6, 5, 1),
        (7, 5, 10),
    ],
    /* sid 11, (-1,  1,  0) */
    &[(2, 4, 11), (3, 5, 11), (2, 5, 2), (3, 4, 6)],
    /* sid 12, ( 1,  0,  0) */
    &[
        (4, 0, 12),
        (5, 0, 5),
        (6, 0, 11),
        (7, 0, 2),
        (4, 1, 3),
        (5, 1, 12),
        (6, 1, 6),
        (7, 1, 11),
        (4, 2, 9),
        (5, 2, 8),
        (6, 2, 12),
        (7, 2, 5),
        (4, 3, 0),
        (5, 3, 9),
        (6, 3, 3),
        (7, 3, 12),
    ],
];

#[inline]
pub(crate) fn cell_index(cdim: [i32; 3], i: i32, j: i32, k: i32) -> usize {
    ((i * cdim[1] + j) * cdim[2] + k) as usize
}

/// The root container: domain geometry, particle arrays, the cell arena
/// with its top-level grid, and the task arena.
pub struct Space {
    pub dim: V3,
    pub periodic: bool,
    /// Top-level grid dimensions.
    pub cdim: [i32; 3],
    /// Top-level cell edge per axis, and its inverse.
    pub h: [f64; 3],
    pub ih: [f64; 3],
    pub h_min: f32,
    pub h_max: f32,
    pub maxdepth: usize,

    pub parts: Vec<Part>,
    pub cparts: Vec<CPart>,

    pub(crate) arena: CellArena,
    /// Top-level cells in grid order.
    pub grid: Vec<CellId>,

    pub tasks: Vec<Task>,
    pub(crate) tasks_size: usize,

    pub params: SpaceParams,
}

impl Space {
    /// Build a space over `parts` and generate the first task graph.
    ///
    /// `cell_max` bounds the top-level cell edge from below, exactly as in
    /// [`Space::rebuild`]. An empty particle set is accepted and produces
    /// an empty task graph.
    pub fn new(dim: V3, parts: Vec<Part>, periodic: bool, cell_max: f64, params: SpaceParams) -> Space {
        let mut s = Space {
            dim,
            periodic,
            cdim: [0; 3],
            h: [0.0; 3],
            ih: [0.0; 3],
            h_min: 0.0,
            h_max: 0.0,
            maxdepth: 0,
            cparts: Vec::with_capacity(parts.len()),
            parts,
            arena: CellArena::new(params.cell_alloc_chunk),
            grid: Vec::new(),
            tasks: Vec::new(),
            tasks_size: 0,
            params,
        };
        s.rebuild(true, cell_max);
        s
    }

    #[inline]
    pub fn nr_cells(&self) -> usize {
        self.grid.len()
    }

    #[inline]
    pub fn cells(&self) -> &[crate::engine::cell::Cell] {
        self.arena.cells()
    }

    #[inline]
    pub fn cell(&self, id: CellId) -> &crate::engine::cell::Cell {
        self.arena.get(id)
    }

    /// Top-level grid index of a position.
    pub fn bin_of(&self, x: &V3) -> usize {
        let mut idx = [0i32; 3];
        for k in 0..3 {
            let i = (x[k] * self.ih[k]).floor() as i32;
            assert!(
                i >= 0 && i < self.cdim[k],
                "particle at {:?} outside the domain on axis {}",
                x,
                k
            );
            idx[k] = i;
        }
        cell_index(self.cdim, idx[0], idx[1], idx[2])
    }

    /// Re-build the cell tree, and the tasks if anything changed.
    ///
    /// The top-level grid is rebuilt when `force` is set or when the grid
    /// dimension needs to shrink to accommodate a larger `h_max`; the split
    /// state of every cell is then re-checked against the drifted particle
    /// positions and smoothing lengths. Returns true if any cell appeared,
    /// disappeared or changed its split state, in which case the task graph
    /// has been regenerated.
    pub fn rebuild(&mut self, force: bool, cell_max: f64) -> bool {
        let mut h_max = 0.0f32;
        let mut h_min = f32::INFINITY;
        for p in &self.parts {
            if p.h > h_max {
                h_max = p.h;
            }
            if p.h < h_min {
                h_min = p.h;
            }
        }
        if self.parts.is_empty() {
            h_min = 0.0;
        }
        self.h_min = h_min;
        self.h_max = h_max;

        let mut cdim = [0i32; 3];
        for k in 0..3 {
            let edge = f64::max(h_max as f64 * self.params.stretch, cell_max);
            assert!(edge > 0.0, "top-level cell edge is zero: h_max and cell_max both vanish");
            cdim[k] = (self.dim[k] / edge).floor() as i32;
            assert!(cdim[k] >= 1, "domain axis {} is shorter than one cell edge", k);
        }

        let mut changes = 0usize;

        // Re-build the upper-level cells?
        if force || cdim[0] < self.cdim[0] || cdim[1] < self.cdim[1] || cdim[2] < self.cdim[2] {
            let old: Vec<CellId> = self.grid.drain(..).collect();
            for cid in old {
                self.recycle_progeny(cid);
                self.arena.recycle(cid);
            }
            self.maxdepth = 0;

            self.cdim = cdim;
            for k in 0..3 {
                self.h[k] = self.dim[k] / cdim[k] as f64;
                self.ih[k] = 1.0 / self.h[k];
            }

            self.grid.reserve((cdim[0] * cdim[1] * cdim[2]) as usize);
            for i in 0..cdim[0] {
                for j in 0..cdim[1] {
                    for k in 0..cdim[2] {
                        let cid = self.arena.alloc();
                        let c = self.arena.get_mut(cid);
                        c.loc = vec3(
                            i as f64 * self.h[0],
                            j as f64 * self.h[1],
                            k as f64 * self.h[2],
                        );
                        c.h = self.h;
                        c.depth = 0;
                        self.grid.push(cid);
                    }
                }
            }
            changes += 1;
            debug!(?cdim, h_max, "rebuilt the top-level grid");
        }

        // Bin the particles into the top-level cells.
        let ind: Vec<i32> = self.parts.iter().map(|p| self.bin_of(&p.x) as i32).collect();
        for g in 0..self.grid.len() {
            let cid = self.grid[g];
            self.arena.get_mut(cid).count = 0;
        }
        for &b in &ind {
            let cid = self.grid[b as usize];
            self.arena.get_mut(cid).count += 1;
        }

        let mut ind = ind;
        let nr_cells = self.grid.len() as i32;
        parts_sort(&mut self.parts, &mut ind, 0, nr_cells);

        // Hook the cells up to their particle ranges.
        let mut finger = 0usize;
        for g in 0..self.grid.len() {
            let cid = self.grid[g];
            let c = self.arena.get_mut(cid);
            c.offset = finger;
            finger += c.count;
        }

        // Check the split state of every subtree.
        for g in 0..self.grid.len() {
            changes += self.rebuild_recurse(self.grid[g]);
        }

        // Mirror the condensed particles. Splitting permuted the particle
        // array, so the shadow is rebuilt only now.
        self.cparts.clear();
        self.cparts.resize(self.parts.len(), CPart::default());
        let (cparts, parts) = (&mut self.cparts, &self.parts);
        par_iter_mut1(cparts, |i, cp| *cp = CPart::from(&parts[i]));

        if changes > 0 {
            self.make_tasks();
        }
        changes > 0
    }

    fn alloc_child(&mut self, parent: CellId, k: usize) -> CellId {
        let (loc, h, depth) = {
            let p = self.arena.get(parent);
            (p.loc, p.h, p.depth)
        };
        let child = self.arena.alloc();
        let c = self.arena.get_mut(child);
        c.h = [h[0] / 2.0, h[1] / 2.0, h[2] / 2.0];
        c.loc = loc;
        if k & 4 != 0 {
            c.loc[0] += c.h[0];
        }
        if k & 2 != 0 {
            c.loc[1] += c.h[1];
        }
        if k & 1 != 0 {
            c.loc[2] += c.h[2];
        }
        c.depth = depth + 1;
        c.parent = Some(parent);
        child
    }

    /// Partition the cell's particle range onto its (fully populated)
    /// progeny and assign their subranges.
    fn partition_cell(&mut self, cid: CellId) {
        let (offset, count, mid) = {
            let c = self.arena.get(cid);
            (c.offset, c.count, c.mid())
        };
        let counts = partition_octants(&mut self.parts[offset..offset + count], &mid);
        let mut finger = offset;
        for k in 0..8 {
            let child = self.arena.get(cid).progeny[k].expect("partitioning expects all 8 progeny");
            let c = self.arena.get_mut(child);
            c.offset = finger;
            c.count = counts[k];
            finger += counts[k];
        }
    }

    /// Count the particles below the split cutoff and the subtree `h_max`.
    fn split_measure(&mut self, cid: CellId) -> (usize, usize) {
        let (offset, count, h_cell, depth) = {
            let c = self.arena.get(cid);
            (c.offset, c.count, c.h, c.depth)
        };
        if depth > self.maxdepth {
            self.maxdepth = depth;
        }
        let h_limit = (h_cell[0].min(h_cell[1]).min(h_cell[2]) / 2.0) as f32;
        let mut below = 0usize;
        let mut h_max = 0.0f32;
        for p in &self.parts[offset..offset + count] {
            if p.h <= h_limit {
                below += 1;
            }
            if p.h > h_max {
                h_max = p.h;
            }
        }
        self.arena.get_mut(cid).h_max = h_max;
        (below, count)
    }

    /// Recursively split a freshly binned cell.
    fn split_cell(&mut self, cid: CellId) {
        let (below, count) = self.split_measure(cid);

        if below as f32 > count as f32 * self.params.split_ratio && count > self.params.split_size {
            self.arena.get_mut(cid).split = true;
            for k in 0..8 {
                let child = self.alloc_child(cid, k);
                self.arena.get_mut(cid).progeny[k] = Some(child);
            }
            self.partition_cell(cid);
            for k in 0..8 {
                let child = self.arena.get(cid).progeny[k].expect("progeny populated above");
                self.split_cell(child);
            }
            for k in 0..8 {
                let child = self.arena.get(cid).progeny[k].expect("progeny populated above");
                if self.arena.get(child).count == 0 {
                    self.arena.recycle(child);
                    self.arena.get_mut(cid).progeny[k] = None;
                }
            }
        } else {
            let c = self.arena.get_mut(cid);
            c.progeny = [None; 8];
            c.split = false;
        }
    }

    /// Re-check an existing subtree after the particles moved: un-split it,
    /// keep it with re-partitioned progeny, or split further. Returns the
    /// number of structural changes.
    fn rebuild_recurse(&mut self, cid: CellId) -> usize {
        let mut changes = 0usize;

        if self.arena.get(cid).split {
            let (below, count) = self.split_measure(cid);

            if (below as f32) < count as f32 * self.params.split_ratio
                || count < self.params.split_size
            {
                self.recycle_progeny(cid);
                self.arena.get_mut(cid).split = false;
                changes += 1;
            } else {
                // Re-populate all progeny, re-partition, drop empties.
                let mut was_empty = [false; 8];
                for k in 0..8 {
                    if self.arena.get(cid).progeny[k].is_none() {
                        was_empty[k] = true;
                        let child = self.alloc_child(cid, k);
                        self.arena.get_mut(cid).progeny[k] = Some(child);
                    }
                }
                self.partition_cell(cid);
                for k in 0..8 {
                    let child = self.arena.get(cid).progeny[k].expect("progeny populated above");
                    if self.arena.get(child).count == 0 {
                        if !was_empty[k] {
                            changes += 1;
                        }
                        self.arena.recycle(child);
                        self.arena.get_mut(cid).progeny[k] = None;
                    } else if was_empty[k] {
                        changes += 1;
                    }
                }
                for k in 0..8 {
                    if let Some(child) = self.arena.get(cid).progeny[k] {
                        changes += self.rebuild_recurse(child);
                    }
                }
            }
        } else {
            self.split_cell(cid);
            if self.arena.get(cid).split {
                changes += 1;
            }
        }
        changes
    }

    /// Recursively dismantle a cell's subtree and recycle the descendants.
    fn recycle_progeny(&mut self, cid: CellId) {
        if self.arena.get(cid).split {
            for k in 0..8 {
                if let Some(child) = self.arena.get(cid).progeny[k] {
                    self.recycle_progeny(child);
                    self.arena.recycle(child);
                    self.arena.get_mut(cid).progeny[k] = None;
                }
            }
        }
    }
}

/// Sort the particles by their bin indices: hybrid quicksort with an
/// insertion-sort tail, the two recursion branches running on independent
/// workers once the partition is large enough. The pivot walks the bin
/// value range `[min, max)`, as the bins are dense integers.
pub(crate) fn parts_sort(parts: &mut [Part], ind: &mut [i32], min: i32, max: i32) {
    let n = parts.len();
    debug_assert_eq!(n, ind.len());

    if n < SORT_INSERTION_CUTOFF {
        for i in 1..n {
            if ind[i] < ind[i - 1] {
                let temp_i = ind[i];
                let temp_p = parts[i].clone();
                let mut j = i;
                while j > 0 && ind[j - 1] > temp_i {
                    ind[j] = ind[j - 1];
                    parts[j] = parts[j - 1].clone();
                    j -= 1;
                }
                ind[j] = temp_i;
                parts[j] = temp_p;
            }
        }
        return;
    }

    let pivot = (min + max) / 2;
    let mut i: isize = 0;
    let mut j: isize = n as isize - 1;
    while i < j {
        while i < n as isize && ind[i as usize] <= pivot {
            i += 1;
        }
        while j >= 0 && ind[j as usize] > pivot {
            j -= 1;
        }
        if i < j {
            ind.swap(i as usize, j as usize);
            parts.swap(i as usize, j as usize);
        }
    }

    // The partition invariant is load-bearing for the whole rebuild; a
    // violation is fatal, not recoverable.
    let split = if j < 0 { 0 } else { (j + 1) as usize };
    for k in 0..split {
        assert!(ind[k] <= pivot, "bin sort failed below the pivot at {}", k);
    }
    for k in split..n {
        assert!(ind[k] > pivot, "bin sort failed above the pivot at {}", k);
    }

    let (lo_p, hi_p) = parts.split_at_mut(split);
    let (lo_i, hi_i) = ind.split_at_mut(split);
    maybe_join(
        n >= SORT_PARALLEL_CUTOFF,
        || {
            if split > 1 && pivot > min {
                parts_sort(lo_p, lo_i, min, pivot);
            }
        },
        || {
            if split < n && pivot + 1 < max {
                parts_sort(hi_p, hi_i, pivot + 1, max);
            }
        },
    );
}

impl Space {
    pub(crate) fn add_task(
        &mut self,
        kind: TaskType,
        subtype: TaskSubtype,
        flags: u32,
        ci: Option<CellId>,
        cj: Option<CellId>,
    ) -> TaskId {
        assert!(
            self.tasks.len() < self.tasks_size,
            "task arena overflow: {} tasks for {} cells",
            self.tasks_size,
            self.arena.tot_cells
        );
        let id = self.tasks.len();
        self.tasks.push(Task::new(kind, subtype, flags, ci, cj));
        id
    }

    /// Stencil encoding of the displacement from `ci` to `cj`, wrapped to
    /// the nearest representative: `9*(dz+1) + 3*(dy+1) + (dx+1)`.
    pub(crate) fn stencil_encoding(&self, ci: CellId, cj: CellId) -> usize {
        let li = self.arena.get(ci).loc;
        let lj = self.arena.get(cj).loc;
        let mut enc = 0usize;
        for k in [2usize, 1, 0] {
            let mut d = lj[k] - li[k];
            if d < -self.dim[k] / 2.0 {
                d += self.dim[k];
            } else if d > self.dim[k] / 2.0 {
                d -= self.dim[k];
            }
            enc = 3 * enc + if d < 0.0 { 0 } else if d > 0.0 { 2 } else { 1 };
        }
        enc
    }

    /// Geometry of a pair at execution time: the direction id, the wrap
    /// shift to add to the second cell's positions, and whether the kernel
    /// has to view the cells in swapped order so that the second one sits
    /// on the positive side of the direction axis.
    pub(crate) fn pair_geometry(&self, ci: CellId, cj: CellId) -> (usize, V3, bool) {
        let li = self.arena.get(ci).loc;
        let lj = self.arena.get(cj).loc;
        let mut shift = V3::zeros();
        for k in 0..3 {
            let d = lj[k] - li[k];
            if d < -self.dim[k] / 2.0 {
                shift[k] = self.dim[k];
            } else if d > self.dim[k] / 2.0 {
                shift[k] = -self.dim[k];
            }
        }
        let enc = self.stencil_encoding(ci, cj);
        debug_assert_ne!(enc, 13, "pair task acting on a single location");
        if enc >= 13 {
            (26 - enc, shift, false)
        } else {
            (enc, -shift, true)
        }
    }

    /// Re-generate the full task graph for the current cell tree.
    pub(crate) fn make_tasks(&mut self) {
        let cap = self.arena.tot_cells * TASKS_PER_CELL;
        if self.tasks.capacity() < cap {
            self.tasks = Vec::with_capacity(cap);
        } else {
            self.tasks.clear();
        }
        self.tasks_size = cap;

        for g in 0..self.grid.len() {
            self.clear_cell_tasks_rec(self.grid[g]);
        }

        // Sorting tasks over the whole tree, parents merging progeny.
        for g in 0..self.grid.len() {
            self.make_sort_tasks_rec(self.grid[g]);
        }

        // The base graph: one self task per non-empty top-level cell, one
        // pair task per 27-stencil neighbour (wrapping if periodic), each
        // depending on the two cells' sorts for the pair direction.
        let cdim = self.cdim;
        for i in 0..cdim[0] {
            for j in 0..cdim[1] {
                for k in 0..cdim[2] {
                    let cid_idx = cell_index(cdim, i, j, k);
                    let ci = self.grid[cid_idx];
                    if self.arena.get(ci).count == 0 {
                        continue;
                    }
                    self.add_task(TaskType::Self_, TaskSubtype::Density, 0, Some(ci), None);

                    for ii in -1i32..=1 {
                        let mut iii = i + ii;
                        if !self.periodic && (iii < 0 || iii >= cdim[0]) {
                            continue;
                        }
                        iii = (iii + cdim[0]) % cdim[0];
                        for jj in -1i32..=1 {
                            let mut jjj = j + jj;
                            if !self.periodic && (jjj < 0 || jjj >= cdim[1]) {
                                continue;
                            }
                            jjj = (jjj + cdim[1]) % cdim[1];
                            for kk in -1i32..=1 {
                                let mut kkk = k + kk;
                                if !self.periodic && (kkk < 0 || kkk >= cdim[2]) {
                                    continue;
                                }
                                kkk = (kkk + cdim[2]) % cdim[2];

                                let cjd_idx = cell_index(cdim, iii, jjj, kkk);
                                let cj = self.grid[cjd_idx];
                                if self.arena.get(cj).count == 0 || cid_idx >= cjd_idx {
                                    continue;
                                }
                                let t = self.add_task(
                                    TaskType::Pair,
                                    TaskSubtype::Density,
                                    0,
                                    Some(ci),
                                    Some(cj),
                                );
                                let enc = (9 * (kk + 1) + 3 * (jj + 1) + (ii + 1)) as usize;
                                let sid = SORTLIST_ID[enc];
                                if let Some(s) = self.arena.get(ci).sorts[sid] {
                                    add_unlock(&mut self.tasks, s, t);
                                }
                                if let Some(s) = self.arena.get(cj).sorts[sid] {
                                    add_unlock(&mut self.tasks, s, t);
                                }
                                self.arena.get_mut(ci).nr_pairs += 1;
                                self.arena.get_mut(cj).nr_pairs += 1;
                            }
                        }
                    }
                }
            }
        }

        self.split_tasks();

        // Remove sort tasks nothing depends on, detaching their own
        // dependencies on the progeny sorts. Parent sorts precede their
        // progeny's in the arena, so one ascending sweep cascades.
        for k in 0..self.tasks.len() {
            if self.tasks[k].kind != TaskType::Sort || !self.tasks[k].unlock_tasks.is_empty() {
                continue;
            }
            let ci = self.tasks[k].ci.expect("sort task without a cell");
            let flags = self.tasks[k].flags;
            if self.arena.get(ci).split {
                for d in 0..13 {
                    if flags & (1 << d) == 0 {
                        continue;
                    }
                    for p in 0..8 {
                        if let Some(child) = self.arena.get(ci).progeny[p] {
                            if let Some(cs) = self.arena.get(child).sorts[d] {
                                rm_unlock_blind(&mut self.tasks, cs, k);
                            }
                        }
                    }
                }
            }
            for s in 0..14 {
                if self.arena.get(ci).sorts[s] == Some(k) {
                    self.arena.get_mut(ci).sorts[s] = None;
                }
            }
            self.tasks[k].kind = TaskType::None;
        }

        // Count the tasks on each cell, register the density tasks, and
        // record which cell locks each interaction task must hold.
        for k in 0..self.tasks.len() {
            let (kind, subtype, ci, cj) = {
                let t = &self.tasks[k];
                (t.kind, t.subtype, t.ci, t.cj)
            };
            match kind {
                TaskType::Self_ | TaskType::Pair | TaskType::Sub => {
                    let ci = ci.expect("interaction task without a cell");
                    self.arena.get_mut(ci).nr_tasks += 1;
                    let mut locks = vec![ci];
                    if let Some(cj) = cj {
                        self.arena.get_mut(cj).nr_tasks += 1;
                        locks.push(cj);
                    }
                    if subtype == TaskSubtype::Density {
                        self.arena.get_mut(ci).density.push(k);
                        if let Some(cj) = cj {
                            self.arena.get_mut(cj).density.push(k);
                        }
                    }
                    self.tasks[k].unlock_cells = locks;
                }
                _ => {}
            }
        }

        // Ghost tasks: one per cell that hosts tasks or sits below a super,
        // chained downwards from the super.
        for g in 0..self.grid.len() {
            self.make_ghosts_rec(self.grid[g]);
        }

        // Force twins: density flows into the super's ghost, the ghost
        // chain releases the force twin of every density task.
        let nr_density_tasks = self.tasks.len();
        for k in 0..nr_density_tasks {
            let (kind, subtype, flags, ci, cj) = {
                let t = &self.tasks[k];
                (t.kind, t.subtype, t.flags, t.ci, t.cj)
            };
            if subtype != TaskSubtype::Density {
                continue;
            }
            if !matches!(kind, TaskType::Self_ | TaskType::Pair | TaskType::Sub) {
                continue;
            }
            let ci = ci.expect("density task without a cell");
            let gs = self.super_ghost(ci);
            add_unlock(&mut self.tasks, k, gs);
            if let Some(cj) = cj {
                let gs = self.super_ghost(cj);
                add_unlock(&mut self.tasks, k, gs);
            }

            let twin_flags = if kind == TaskType::Sub { flags } else { 0 };
            let t2 = self.add_task(kind, TaskSubtype::Force, twin_flags, Some(ci), cj);
            let gi = self.arena.get(ci).ghost.expect("acting cell without a ghost");
            add_unlock(&mut self.tasks, gi, t2);
            if let Some(cj) = cj {
                let gj = self.arena.get(cj).ghost.expect("acting cell without a ghost");
                add_unlock(&mut self.tasks, gj, t2);
            }
            self.tasks[t2].unlock_cells = self.tasks[k].unlock_cells.clone();
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut counts = [0usize; 6];
            for t in &self.tasks {
                counts[t.kind as usize] += 1;
            }
            debug!(
                none = counts[0],
                sort = counts[1],
                self_ = counts[2],
                pair = counts[3],
                sub = counts[4],
                ghost = counts[5],
                "task graph regenerated"
            );
        }
    }

    fn super_ghost(&self, cid: CellId) -> TaskId {
        let sup = self.arena.get(cid).super_id.expect("super not resolved yet");
        self.arena.get(sup).ghost.expect("super cell without a ghost")
    }

    fn clear_cell_tasks_rec(&mut self, cid: CellId) {
        self.arena.get_mut(cid).clear_tasks();
        for k in 0..8 {
            if let Some(child) = self.arena.get(cid).progeny[k] {
                self.clear_cell_tasks_rec(child);
            }
        }
    }

    /// Generate the sort tasks of a subtree, bottom-up: a split cell's sort
    /// merges its progeny's sorted streams, so it depends on them.
    ///
    /// Granularity: small cells get one task for all 13 directions, large
    /// ones up to seven tasks of two directions each. Consecutive `sorts`
    /// entries aliasing one task mark the grouping.
    fn make_sort_tasks_rec(&mut self, cid: CellId) {
        let count = self.arena.get(cid).count;
        if count > 0 {
            if count < 1000 {
                let t = self.add_task(TaskType::Sort, TaskSubtype::None, 0x1fff, Some(cid), None);
                for k in 0..13 {
                    self.arena.get_mut(cid).sorts[k] = Some(t);
                }
            } else if count < 5000 {
                let t = self.add_task(TaskType::Sort, TaskSubtype::None, 0x7f, Some(cid), None);
                for k in 0..7 {
                    self.arena.get_mut(cid).sorts[k] = Some(t);
                }
                let t = self.add_task(TaskType::Sort, TaskSubtype::None, 0x1f80, Some(cid), None);
                for k in 7..14 {
                    self.arena.get_mut(cid).sorts[k] = Some(t);
                }
            } else {
                for g in 0..7 {
                    let flags = if g < 6 { 0x3 << (2 * g) } else { 0x1000 };
                    let t = self.add_task(TaskType::Sort, TaskSubtype::None, flags, Some(cid), None);
                    self.arena.get_mut(cid).sorts[2 * g] = Some(t);
                    self.arena.get_mut(cid).sorts[2 * g + 1] = Some(t);
                }
            }
        }

        if self.arena.get(cid).split {
            for p in 0..8 {
                let Some(child) = self.arena.get(cid).progeny[p] else {
                    continue;
                };
                self.make_sort_tasks_rec(child);
                for j in 0..14 {
                    let sorts = self.arena.get(cid).sorts;
                    if j > 0 && sorts[j] == sorts[j - 1] {
                        continue;
                    }
                    if let (Some(cs), Some(ps)) = (self.arena.get(child).sorts[j], sorts[j]) {
                        add_unlock(&mut self.tasks, cs, ps);
                    }
                }
            }
        }
    }

    /// Refine self and pair tasks over split cells. The task list grows
    /// while it is being swept; re-pointed tasks are re-examined at the
    /// same index and appended tasks are reached later in the same sweep.
    pub(crate) fn split_tasks(&mut self) {
        let mut tid = 0;
        while tid < self.tasks.len() {
            match self.tasks[tid].kind {
                TaskType::Self_ => {
                    let ci = self.tasks[tid].ci.expect("self task without a cell");
                    if !self.arena.get(ci).split {
                        tid += 1;
                        continue;
                    }

                    if self.arena.get(ci).count < self.params.sub_size {
                        // Recurse inside one task; it now has pairwise
                        // components, so every direction must be sorted.
                        self.tasks[tid].kind = TaskType::Sub;
                        let sorts = self.arena.get(ci).sorts;
                        for k in 0..14 {
                            if k > 0 && sorts[k] == sorts[k - 1] {
                                continue;
                            }
                            if let Some(s) = sorts[k] {
                                add_unlock(&mut self.tasks, s, tid);
                            }
                        }
                        tid += 1;
                    } else {
                        // One self task per non-empty child, the first one
                        // recycling this task's slot, plus a pair task per
                        // unordered pair of children.
                        let progeny = self.arena.get(ci).progeny;
                        let first = progeny
                            .iter()
                            .flatten()
                            .next()
                            .copied()
                            .expect("split cell with no progeny");
                        self.tasks[tid].ci = Some(first);
                        for k in 0..8 {
                            if let Some(child) = progeny[k] {
                                if child != first {
                                    self.add_task(
                                        TaskType::Self_,
                                        TaskSubtype::Density,
                                        0,
                                        Some(child),
                                        None,
                                    );
                                }
                            }
                        }
                        for j in 0..8 {
                            let Some(pj) = progeny[j] else { continue };
                            if self.arena.get(pj).count == 0 {
                                continue;
                            }
                            for k in j + 1..8 {
                                let Some(pk) = progeny[k] else { continue };
                                if self.arena.get(pk).count == 0 {
                                    continue;
                                }
                                let t = self.add_task(
                                    TaskType::Pair,
                                    TaskSubtype::Density,
                                    0,
                                    Some(pj),
                                    Some(pk),
                                );
                                let sid = PTS[j][k] as usize;
                                if let Some(s) = self.arena.get(pj).sorts[sid] {
                                    add_unlock(&mut self.tasks, s, t);
                                }
                                if let Some(s) = self.arena.get(pk).sorts[sid] {
                                    add_unlock(&mut self.tasks, s, t);
                                }
                                self.arena.get_mut(pj).nr_pairs += 1;
                                self.arena.get_mut(pk).nr_pairs += 1;
                            }
                        }
                        // Re-examine the re-pointed task in place.
                    }
                }

                TaskType::Pair => {
                    let ci0 = self.tasks[tid].ci.expect("pair task without ci");
                    let cj0 = self.tasks[tid].cj.expect("pair task without cj");
                    let (ci_split, ci_hmax, ci_h) = {
                        let c = self.arena.get(ci0);
                        (c.split, c.h_max, c.h)
                    };
                    let (cj_split, cj_hmax, cj_h) = {
                        let c = self.arena.get(cj0);
                        (c.split, c.h_max, c.h)
                    };
                    let hi = ci_h[0].max(ci_h[1]).max(ci_h[2]);
                    let hj = cj_h[0].max(cj_h[1]).max(cj_h[2]);

                    // Refinable only while the children still have room to
                    // interact without crossing two tree levels.
                    let refinable = ci_split
                        && cj_split
                        && (ci_hmax as f64) * self.params.stretch < hi / 2.0
                        && (cj_hmax as f64) * self.params.stretch < hj / 2.0;
                    if !refinable {
                        tid += 1;
                        continue;
                    }

                    let (mut ci, mut cj) = (ci0, cj0);
                    let enc = self.stencil_encoding(ci, cj);
                    let sid;
                    if enc < 13 {
                        std::mem::swap(&mut ci, &mut cj);
                        self.tasks[tid].ci = Some(ci);
                        self.tasks[tid].cj = Some(cj);
                        sid = enc;
                    } else {
                        sid = 26 - enc;
                    }

                    // Face or edge pairs small enough become one recursive
                    // sub task over both subtrees.
                    if self.arena.get(ci).count < self.params.sub_size
                        && self.arena.get(cj).count < self.params.sub_size
                        && sid != 0
                        && sid != 2
                        && sid != 6
                        && sid != 8
                    {
                        self.tasks[tid].kind = TaskType::Sub;
                        self.tasks[tid].flags = sid as u32;
                        for side in [ci, cj] {
                            for p in 0..8 {
                                let Some(child) = self.arena.get(side).progeny[p] else {
                                    continue;
                                };
                                let sorts = self.arena.get(child).sorts;
                                for k in 0..14 {
                                    if let Some(s) = sorts[k] {
                                        add_unlock(&mut self.tasks, s, tid);
                                    }
                                }
                            }
                        }
                        tid += 1;
                        continue;
                    }

                    // Replace by the explicit child pairs of this stencil
                    // direction; the first live pair recycles the slot.
                    let subtype = self.tasks[tid].subtype;
                    if let Some(s) = self.arena.get(ci).sorts[sid] {
                        rm_unlock(&mut self.tasks, s, tid);
                    }
                    if let Some(s) = self.arena.get(cj).sorts[sid] {
                        rm_unlock(&mut self.tasks, s, tid);
                    }
                    self.arena.get_mut(ci).nr_pairs -= 1;
                    self.arena.get_mut(cj).nr_pairs -= 1;

                    let ci_prog = self.arena.get(ci).progeny;
                    let cj_prog = self.arena.get(cj).progeny;
                    let mut reused = false;
                    for &(pi, pj, dsid) in PAIR_SPLIT[sid] {
                        let (Some(a), Some(b)) = (ci_prog[pi], cj_prog[pj]) else {
                            continue;
                        };
                        let t = if !reused {
                            reused = true;
                            self.tasks[tid].ci = Some(a);
                            self.tasks[tid].cj = Some(b);
                            tid
                        } else {
                            self.add_task(TaskType::Pair, subtype, 0, Some(a), Some(b))
                        };
                        if let Some(s) = self.arena.get(a).sorts[dsid] {
                            add_unlock(&mut self.tasks, s, t);
                        }
                        if let Some(s) = self.arena.get(b).sorts[dsid] {
                            add_unlock(&mut self.tasks, s, t);
                        }
                        self.arena.get_mut(a).nr_pairs += 1;
                        self.arena.get_mut(b).nr_pairs += 1;
                    }
                    if !reused {
                        // Every child pair was empty on one side.
                        self.tasks[tid].kind = TaskType::None;
                        tid += 1;
                    }
                    // Otherwise re-examine the re-pointed task in place.
                }

                _ => {
                    tid += 1;
                }
            }
        }
    }

    /// Resolve each cell's super and append the ghost chain, parents first.
    fn make_ghosts_rec(&mut self, cid: CellId) {
        let mut sup = cid;
        let mut finger = self.arena.get(cid).parent;
        while let Some(f) = finger {
            if self.arena.get(f).nr_tasks > 0 {
                sup = f;
            }
            finger = self.arena.get(f).parent;
        }
        self.arena.get_mut(cid).super_id = Some(sup);

        if sup != cid || self.arena.get(cid).nr_tasks > 0 {
            let g = self.add_task(TaskType::Ghost, TaskSubtype::None, 0, Some(cid), None);
            self.arena.get_mut(cid).ghost = Some(g);
            if sup != cid {
                let parent = self.arena.get(cid).parent.expect("non-super cell without parent");
                let pg = self
                    .arena
                    .get(parent)
                    .ghost
                    .expect("parent ghost created before its progeny's");
                add_unlock(&mut self.tasks, pg, g);
            }
        }

        for k in 0..8 {
            if let Some(child) = self.arena.get(cid).progeny[k] {
                self.make_ghosts_rec(child);
            }
        }
    }
}
