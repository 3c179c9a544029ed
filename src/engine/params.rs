use serde::{Deserialize, Serialize};

/// Tunables of the space and its scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpaceParams {
    /// Minimum particle count before a cell is considered for splitting.
    pub split_size: usize,

    /// Fraction of a cell's particles that must have `h <= side / 2` for
    /// the split to go ahead.
    pub split_ratio: f32,

    /// Below this particle count a refinable self/pair task is converted to
    /// a recursive sub task instead of being split into explicit child
    /// tasks.
    pub sub_size: usize,

    /// Safety margin on the top-level cell edge relative to the largest
    /// smoothing length, so particles near a face still find all their
    /// neighbours in the 27-cell stencil.
    pub stretch: f64,

    /// Batch size for cell arena growth.
    pub cell_alloc_chunk: usize,

    /// Worker thread pool size for draining the task graph.
    pub workers: usize,
}

impl Default for SpaceParams {
    fn default() -> SpaceParams {
        SpaceParams {
            split_size: 400,
            split_ratio: 0.5,
            sub_size: 1000,
            stretch: 1.05,
            cell_alloc_chunk: 1000,
            workers: 4,
        }
    }
}
