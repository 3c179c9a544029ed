/*!
Shared-memory task-parallel core for Smoothed Particle Hydrodynamics.

The crate partitions a periodic or non-periodic 3D domain into an adaptive
oct-tree of cells, compiles all short-range pair interactions into a
dependency graph of fine-grained tasks (sort / self / pair / sub / ghost),
and drains that graph on a fixed pool of worker threads. Physics kernels are
external: they plug in through the [`Kernels`] trait and receive contiguous
particle slices per cell.
*/

mod engine;

pub use engine::*;
