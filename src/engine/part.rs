use crate::engine::V3;

/// A fluid sample. The core only reads `x`, `h` and `dt`; the remaining
/// fields are physics state that kernels own (density/force accumulators,
/// velocity, pressure).
#[derive(Debug, Clone)]
pub struct Part {
    pub id: u64,
    pub x: V3,
    pub v: [f32; 3],
    pub mass: f32,
    /// Smoothing length: the kernel support radius. Interactions are limited
    /// to pairs closer than the larger of the two supports.
    pub h: f32,
    /// Proposed time step, exposed as a per-particle hint to the host.
    pub dt: f32,
    pub rho: f32,
    pub wcount: f32,
    pub pressure: f32,
    pub a: [f32; 3],
}

impl Part {
    pub fn new(id: u64, x: V3, h: f32) -> Part {
        Part {
            id,
            x,
            v: [0.0; 3],
            mass: 1.0,
            h,
            dt: 0.0,
            rho: 0.0,
            wcount: 0.0,
            pressure: 0.0,
            a: [0.0; 3],
        }
    }
}

/// Condensed particle: a packed shadow of `{x, h, dt}` so the neighbour
/// loops fit more particles per cache line. After every rebuild,
/// `cparts[i]` mirrors `parts[i]`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CPart {
    pub x: [f64; 3],
    pub h: f32,
    pub dt: f32,
}

impl From<&Part> for CPart {
    fn from(p: &Part) -> CPart {
        CPart {
            x: [p.x[0], p.x[1], p.x[2]],
            h: p.h,
            dt: p.dt,
        }
    }
}
