use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::deque::{Injector, Steal};
use tracing::trace;

use crate::engine::cell::{lock_tree, unlock_tree, Cell};
use crate::engine::lock::SpinWait;
use crate::engine::part::{CPart, Part};
use crate::engine::sort::{merge_progeny, sort_leaf, SortEntry, NR_DIRECTIONS};
use crate::engine::space::{Space, PAIR_SPLIT};
use crate::engine::task::{Task, TaskSubtype, TaskType};
use crate::engine::{CellId, TaskId, V3};

/// The per-cell data a kernel sees: the cell's contiguous particle slice,
/// its condensed shadow, the sorted permutation for the pair direction (when
/// one applies), and the cell geometry.
pub struct CellView<'a> {
    pub parts: &'a mut [Part],
    pub cparts: &'a [CPart],
    pub sort: Option<&'a [SortEntry]>,
    pub loc: V3,
    pub width: [f64; 3],
    pub h_max: f32,
}

/// The physics callbacks the scheduler drives. For pair kernels, `cj` sits
/// on the positive side of the direction axis `sid` once `shift` has been
/// added to its positions; both sort views are ordered along that axis.
///
/// Kernels may mutate particle state only; they never see scheduler state.
pub trait Kernels: Sync {
    fn density_self(&self, ci: CellView);
    fn density_pair(&self, ci: CellView, cj: CellView, sid: usize, shift: V3);
    fn force_self(&self, ci: CellView);
    fn force_pair(&self, ci: CellView, cj: CellView, sid: usize, shift: V3);

    /// Per-particle work between the density and force phases, invoked once
    /// per super cell (covering its whole subtree). No-op by default.
    fn ghost(&self, _ci: CellView) {}
}

/// Raw shared pointer that may cross threads. Exclusive access to whatever
/// it points at is guaranteed by the task graph and the cell locks, never
/// by the type system.
struct SharedPtr<T> {
    ptr: *mut T,
}

unsafe impl<T> Send for SharedPtr<T> {}
unsafe impl<T> Sync for SharedPtr<T> {}

struct Runner<'s, K: Kernels> {
    space: &'s Space,
    tasks: &'s [Task],
    parts: SharedPtr<Part>,
    cells: SharedPtr<Cell>,
    nr_cells_total: usize,
    kernels: &'s K,
    queue: &'s Injector<TaskId>,
    remaining: &'s AtomicUsize,
}

impl<'s, K: Kernels> Runner<'s, K> {
    #[inline]
    fn cells_slice(&self) -> &[Cell] {
        unsafe { std::slice::from_raw_parts(self.cells.ptr, self.nr_cells_total) }
    }

    /// Kernel-facing view of a cell. The mutable particle slice aliases
    /// nothing else: interaction tasks hold the cell tree locks and sort
    /// tasks only read positions.
    fn view(&self, cid: CellId, dir: Option<usize>) -> CellView<'_> {
        let c = self.space.cell(cid);
        let parts =
            unsafe { std::slice::from_raw_parts_mut(self.parts.ptr.add(c.offset), c.count) };
        CellView {
            parts,
            cparts: &self.space.cparts[c.offset..c.offset + c.count],
            sort: dir.map(|d| self.space.cell(cid).sort_data[d].as_slice()),
            loc: c.loc,
            width: c.h,
            h_max: c.h_max,
        }
    }

    /// Produce the sorted permutations for every direction bit in `flags`:
    /// leaves sort outright, split cells merge their progeny's streams
    /// (complete by dependency).
    fn do_sort(&self, cid: CellId, flags: u32) {
        let c = self.space.cell(cid);
        for d in 0..NR_DIRECTIONS {
            if flags & (1 << d) == 0 {
                continue;
            }
            // The graph gives this task exclusive write access to the
            // per-direction slot; concurrent sort tasks of the same cell
            // cover disjoint direction bits.
            let out: &mut Vec<SortEntry> =
                unsafe { &mut *std::ptr::addr_of_mut!((*self.cells.ptr.add(cid)).sort_data[d]) };
            if c.split {
                let mut streams: Vec<(&[SortEntry], usize)> = Vec::with_capacity(8);
                for k in 0..8 {
                    if let Some(child) = c.progeny[k] {
                        let cc = self.space.cell(child);
                        streams.push((cc.sort_data[d].as_slice(), cc.offset - c.offset));
                    }
                }
                merge_progeny(&streams, out);
            } else {
                let parts: &[Part] =
                    unsafe { std::slice::from_raw_parts(self.parts.ptr.add(c.offset), c.count) };
                sort_leaf(parts, d, out);
            }
        }
    }

    /// Try to lock the acting cells in ascending id order; all-or-nothing.
    fn lock_cells(&self, ids: &[CellId]) -> bool {
        let cells = self.cells_slice();
        match ids {
            [] => true,
            [a] => lock_tree(cells, *a),
            [a, b] => {
                let (x, y) = if a < b { (*a, *b) } else { (*b, *a) };
                if !lock_tree(cells, x) {
                    return false;
                }
                if !lock_tree(cells, y) {
                    unlock_tree(cells, x);
                    return false;
                }
                true
            }
            _ => unreachable!("tasks act on at most two cells"),
        }
    }

    fn unlock_cells(&self, ids: &[CellId]) {
        let cells = self.cells_slice();
        for &cid in ids {
            unlock_tree(cells, cid);
        }
    }

    fn run_pair(&self, ci: CellId, cj: CellId, subtype: TaskSubtype) {
        let (sid, shift, flip) = self.space.pair_geometry(ci, cj);
        let (a, b) = if flip { (cj, ci) } else { (ci, cj) };
        let vi = self.view(a, Some(sid));
        let vj = self.view(b, Some(sid));
        match subtype {
            TaskSubtype::Density => self.kernels.density_pair(vi, vj, sid, shift),
            TaskSubtype::Force => self.kernels.force_pair(vi, vj, sid, shift),
            TaskSubtype::None => unreachable!("pair task without a subtype"),
        }
    }

    fn run_self(&self, ci: CellId, subtype: TaskSubtype) {
        let v = self.view(ci, None);
        match subtype {
            TaskSubtype::Density => self.kernels.density_self(v),
            TaskSubtype::Force => self.kernels.force_self(v),
            TaskSubtype::None => unreachable!("self task without a subtype"),
        }
    }

    /// Execute a sub task: re-apply the split stencil at run time, bottoming
    /// out in kernel calls on leaf cells and non-refinable pairs.
    fn do_sub(&self, ci: CellId, cj: Option<CellId>, subtype: TaskSubtype) {
        match cj {
            None => {
                let c = self.space.cell(ci);
                if c.split {
                    for j in 0..8 {
                        let Some(pj) = c.progeny[j] else { continue };
                        self.do_sub(pj, None, subtype);
                        for k in j + 1..8 {
                            let Some(pk) = c.progeny[k] else { continue };
                            self.do_sub(pj, Some(pk), subtype);
                        }
                    }
                } else {
                    self.run_self(ci, subtype);
                }
            }
            Some(cj) => {
                let a = self.space.cell(ci);
                let b = self.space.cell(cj);
                let ha = a.h[0].max(a.h[1]).max(a.h[2]);
                let hb = b.h[0].max(b.h[1]).max(b.h[2]);
                let stretch = self.space.params.stretch;
                let refinable = a.split
                    && b.split
                    && (a.h_max as f64) * stretch < ha / 2.0
                    && (b.h_max as f64) * stretch < hb / 2.0;
                if refinable {
                    let (sid, _shift, flip) = self.space.pair_geometry(ci, cj);
                    let (x, y) = if flip { (cj, ci) } else { (ci, cj) };
                    let xp = self.space.cell(x).progeny;
                    let yp = self.space.cell(y).progeny;
                    for &(pi, pj, _dsid) in PAIR_SPLIT[sid] {
                        if let (Some(aa), Some(bb)) = (xp[pi], yp[pj]) {
                            self.do_sub(aa, Some(bb), subtype);
                        }
                    }
                } else {
                    self.run_pair(ci, cj, subtype);
                }
            }
        }
    }

    /// Execute one task. Returns false if the cell locks were contended and
    /// the task has to go back to the queue.
    fn execute(&self, tid: TaskId) -> bool {
        let t = &self.tasks[tid];
        match t.kind {
            TaskType::Sort => {
                self.do_sort(t.ci.expect("sort task without a cell"), t.flags);
                true
            }
            TaskType::Ghost => {
                let ci = t.ci.expect("ghost task without a cell");
                // The ghost body runs once per super cell; ghosts further
                // down the chain are pure synchronisation nodes.
                if self.space.cell(ci).super_id == Some(ci) {
                    self.kernels.ghost(self.view(ci, None));
                }
                true
            }
            TaskType::Self_ | TaskType::Pair | TaskType::Sub => {
                if !self.lock_cells(&t.unlock_cells) {
                    return false;
                }
                let ci = t.ci.expect("interaction task without a cell");
                match t.kind {
                    TaskType::Self_ => self.run_self(ci, t.subtype),
                    TaskType::Pair => {
                        self.run_pair(ci, t.cj.expect("pair task without cj"), t.subtype)
                    }
                    TaskType::Sub => self.do_sub(ci, t.cj, t.subtype),
                    _ => unreachable!(),
                }
                self.unlock_cells(&t.unlock_cells);
                true
            }
            TaskType::None => true,
        }
    }

    /// Decrement the successors' wait counters and hand the released ones to
    /// the queue; the fetch-sub pairs the release of our writes with the
    /// acquire of whoever pops the successor.
    fn complete(&self, tid: TaskId) {
        for &succ in &self.tasks[tid].unlock_tasks {
            if self.tasks[succ].wait.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.queue.push(succ);
            }
        }
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    fn worker(&self) {
        let mut spin = SpinWait::new();
        loop {
            if self.remaining.load(Ordering::Acquire) == 0 {
                break;
            }
            match self.queue.steal() {
                Steal::Success(tid) => {
                    if self.execute(tid) {
                        self.complete(tid);
                        spin.reset();
                    } else {
                        // Contended cell locks: back off and requeue.
                        trace!(tid, "task deferred on cell locks");
                        self.queue.push(tid);
                        spin.spin_once();
                    }
                }
                Steal::Empty => spin.spin_once(),
                Steal::Retry => {}
            }
        }
    }
}

impl Space {
    /// Drain the current task graph on the configured worker pool.
    ///
    /// Wait counters are recomputed from the dependency edges, so the same
    /// graph can be run repeatedly; with a single worker the execution
    /// order is deterministic.
    pub fn run<K: Kernels>(&mut self, kernels: &K) {
        let workers = self.params.workers.max(1);

        for t in &self.tasks {
            t.wait.store(0, Ordering::Relaxed);
        }
        let mut live = 0usize;
        for k in 0..self.tasks.len() {
            if self.tasks[k].kind == TaskType::None {
                continue;
            }
            live += 1;
            for &succ in &self.tasks[k].unlock_tasks {
                self.tasks[succ].wait.fetch_add(1, Ordering::Relaxed);
            }
        }
        if live == 0 {
            return;
        }

        let parts_ptr = self.parts.as_mut_ptr();
        let cells_ptr = self.arena.as_mut_ptr();
        let nr_cells_total = self.arena.cells().len();

        let queue = Injector::new();
        for (k, t) in self.tasks.iter().enumerate() {
            if t.kind != TaskType::None && t.wait.load(Ordering::Relaxed) == 0 {
                queue.push(k);
            }
        }
        let remaining = AtomicUsize::new(live);

        let space: &Space = &*self;
        let runner = Runner {
            space,
            tasks: &space.tasks,
            parts: SharedPtr { ptr: parts_ptr },
            cells: SharedPtr { ptr: cells_ptr },
            nr_cells_total,
            kernels,
            queue: &queue,
            remaining: &remaining,
        };

        crossbeam::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| runner.worker());
            }
        })
        .expect("a worker thread panicked");

        debug_assert_eq!(remaining.load(Ordering::Relaxed), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hydro::{reset_accumulators, tait_pressure, w_cubic, SphKernels};
    use crate::engine::params::SpaceParams;
    use crate::engine::part::Part;
    use crate::engine::{vec3, Space};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cloud(n: usize, dim: V3, h: f32, seed: u64) -> Vec<Part> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let x = vec3(
                    rng.gen::<f64>() * dim[0],
                    rng.gen::<f64>() * dim[1],
                    rng.gen::<f64>() * dim[2],
                );
                let mut p = Part::new(i as u64, x, h);
                p.mass = 1.5;
                p
            })
            .collect()
    }

    /// O(N^2) density reference: gather over every particle with the
    /// receiving particle's support, self contribution included.
    fn brute_force_density(parts: &[Part], dim: &V3, periodic: bool) -> Vec<f32> {
        let n = parts.len();
        let mut rho = vec![0.0f32; n];
        for i in 0..n {
            let hi = parts[i].h;
            for j in 0..n {
                let mut r2 = 0.0f64;
                for k in 0..3 {
                    let mut d = parts[i].x[k] - parts[j].x[k];
                    if periodic {
                        if d > dim[k] / 2.0 {
                            d -= dim[k];
                        } else if d < -dim[k] / 2.0 {
                            d += dim[k];
                        }
                    }
                    r2 += d * d;
                }
                if (r2 as f32) < hi * hi {
                    rho[i] += parts[j].mass * w_cubic((r2 as f32).sqrt(), hi);
                }
            }
        }
        rho
    }

    fn assert_density_matches(s: &Space, periodic: bool) {
        let reference = brute_force_density(&s.parts, &s.dim, periodic);
        for (i, p) in s.parts.iter().enumerate() {
            let want = reference[i];
            let got = p.rho;
            assert!(
                (got - want).abs() <= 1e-3 * want.abs().max(1.0),
                "particle {} density mismatch: engine {} reference {}",
                p.id,
                got,
                want
            );
        }
    }

    #[test]
    fn flat_grid_density_matches_brute_force() {
        let dim = vec3(1.0, 1.0, 1.0);
        let parts = cloud(600, dim, 0.12, 101);
        let mut params = SpaceParams::default();
        params.workers = 1;
        let mut s = Space::new(dim, parts, false, 0.25, params);
        assert!(s.grid.iter().all(|&c| !s.cell(c).split));

        let kernels = SphKernels::default();
        reset_accumulators(&mut s.parts);
        s.run(&kernels);
        assert_density_matches(&s, false);
    }

    #[test]
    fn split_tree_with_subs_matches_brute_force() {
        let dim = vec3(0.5, 0.5, 0.5);
        let parts = cloud(5000, dim, 0.03, 103);
        let mut params = SpaceParams::default();
        params.workers = 1;
        let mut s = Space::new(dim, parts, false, 0.25, params);

        // The tree must actually have split cells and sub tasks for this
        // test to mean anything.
        assert!(s.grid.iter().any(|&c| s.cell(c).split));
        assert!(s.tasks.iter().any(|t| t.kind == TaskType::Sub));

        let kernels = SphKernels::default();
        reset_accumulators(&mut s.parts);
        s.run(&kernels);
        assert_density_matches(&s, false);

        // Pressures were produced by the ghost phase from the density.
        for p in &s.parts {
            assert_eq!(
                p.pressure,
                tait_pressure(p.rho, kernels.rest_density, kernels.sound_speed)
            );
        }
    }

    #[test]
    fn periodic_wrap_density_matches_brute_force() {
        let dim = vec3(1.0, 1.0, 1.0);
        let parts = cloud(800, dim, 0.1, 107);
        let mut params = SpaceParams::default();
        params.workers = 1;
        let mut s = Space::new(dim, parts, true, 0.3, params);

        let kernels = SphKernels::default();
        reset_accumulators(&mut s.parts);
        s.run(&kernels);
        assert_density_matches(&s, true);
    }

    #[test]
    fn single_worker_runs_are_bit_identical() {
        let dim = vec3(0.5, 0.5, 0.5);
        let parts = cloud(3000, dim, 0.04, 109);
        let mut params = SpaceParams::default();
        params.workers = 1;
        let mut s = Space::new(dim, parts, false, 0.25, params);
        let kernels = SphKernels::default();

        reset_accumulators(&mut s.parts);
        s.run(&kernels);
        let first: Vec<(u64, f32, f32, [f32; 3])> = s
            .parts
            .iter()
            .map(|p| (p.id, p.rho, p.pressure, p.a))
            .collect();

        reset_accumulators(&mut s.parts);
        s.run(&kernels);
        let second: Vec<(u64, f32, f32, [f32; 3])> = s
            .parts
            .iter()
            .map(|p| (p.id, p.rho, p.pressure, p.a))
            .collect();

        assert_eq!(first, second);
    }

    #[test]
    fn parallel_run_agrees_with_serial() {
        let dim = vec3(0.5, 0.5, 0.5);
        let parts = cloud(4000, dim, 0.035, 113);

        let mut params = SpaceParams::default();
        params.workers = 1;
        let mut serial = Space::new(dim, parts.clone(), false, 0.25, params);
        let kernels = SphKernels::default();
        reset_accumulators(&mut serial.parts);
        serial.run(&kernels);

        params.workers = 4;
        let mut parallel = Space::new(dim, parts, false, 0.25, params);
        reset_accumulators(&mut parallel.parts);
        parallel.run(&kernels);

        let mut serial_by_id: Vec<(u64, f32)> =
            serial.parts.iter().map(|p| (p.id, p.rho)).collect();
        let mut parallel_by_id: Vec<(u64, f32)> =
            parallel.parts.iter().map(|p| (p.id, p.rho)).collect();
        serial_by_id.sort_unstable_by_key(|e| e.0);
        parallel_by_id.sort_unstable_by_key(|e| e.0);

        for ((id_a, rho_a), (id_b, rho_b)) in serial_by_id.iter().zip(parallel_by_id.iter()) {
            assert_eq!(id_a, id_b);
            // Neighbour sums commute only approximately in f32.
            assert!(
                (rho_a - rho_b).abs() <= 1e-3 * rho_a.abs().max(1.0),
                "particle {}: serial {} parallel {}",
                id_a,
                rho_a,
                rho_b
            );
        }
    }

    #[test]
    fn forces_follow_the_density_phase() {
        let dim = vec3(0.5, 0.5, 0.5);
        let parts = cloud(2500, dim, 0.04, 127);
        let mut params = SpaceParams::default();
        params.workers = 4;
        let mut s = Space::new(dim, parts, false, 0.25, params);
        let kernels = SphKernels::default();
        reset_accumulators(&mut s.parts);
        s.run(&kernels);

        // Forces computed from the engine's own converged density/pressure
        // state must match a brute-force sweep over the same state.
        let n = s.parts.len();
        for i in (0..n).step_by(97) {
            let pi = &s.parts[i];
            if pi.rho <= 0.0 {
                continue;
            }
            let mut want = [0.0f32; 3];
            let mut magnitude = 0.0f32;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let pj = &s.parts[j];
                let dx = pi.x - pj.x;
                let r2 = dx.norm_squared() as f32;
                if r2 >= pi.h * pi.h || r2 == 0.0 || pj.rho <= 0.0 {
                    continue;
                }
                let r = r2.sqrt();
                let coef = -pj.mass
                    * (pi.pressure / (pi.rho * pi.rho) + pj.pressure / (pj.rho * pj.rho))
                    * crate::engine::hydro::dw_cubic(r, pi.h);
                magnitude += coef.abs();
                for k in 0..3 {
                    want[k] += coef * (dx[k] as f32) / r;
                }
            }
            // Contributions largely cancel in a uniform cloud, so the bound
            // scales with their magnitude rather than the residual.
            for k in 0..3 {
                assert!(
                    (pi.a[k] - want[k]).abs() <= 1e-4 * magnitude + 1e-3,
                    "particle {} axis {}: engine {} reference {}",
                    pi.id,
                    k,
                    pi.a[k],
                    want[k]
                );
            }
        }
    }

    #[test]
    fn empty_graph_run_returns() {
        let mut s = Space::new(
            vec3(1.0, 1.0, 1.0),
            Vec::new(),
            false,
            0.5,
            SpaceParams::default(),
        );
        s.run(&SphKernels::default());
    }
}
