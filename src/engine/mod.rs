pub mod cell;
pub mod concurrency;
pub mod hydro;
pub mod lock;
pub mod params;
pub mod part;
pub mod scheduler;
pub mod sort;
pub mod space;
pub mod task;

use nalgebra::Vector3;

/// Positions and cell geometry are double precision; per-particle scalars
/// (smoothing length, time hint) are single precision.
pub type V3 = Vector3<f64>;

/// Index handle into the cell arena. Cells form a tree with up- and
/// down-pointers, so they live in an arena and refer to each other by index.
pub type CellId = usize;

/// Index handle into the append-only task arena. The task list grows while
/// it is being iterated, so no references are ever taken across growth.
pub type TaskId = usize;

pub fn vec3(x: f64, y: f64, z: f64) -> V3 {
    [x, y, z].into()
}

pub use cell::Cell;
pub use hydro::SphKernels;
pub use params::SpaceParams;
pub use part::{CPart, Part};
pub use scheduler::{CellView, Kernels};
pub use sort::SortEntry;
pub use space::Space;
pub use task::{Task, TaskSubtype, TaskType};
