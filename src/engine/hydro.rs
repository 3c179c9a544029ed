//! Reference SPH kernels: cubic-spline density with a Tait equation of
//! state for the force phase. This is the demonstration implementation of
//! the [`Kernels`] contract used by the end-to-end tests; the engine core
//! never depends on it.

use crate::engine::part::Part;
use crate::engine::scheduler::{CellView, Kernels};
use crate::engine::sort::AXES;
use crate::engine::V3;

use std::f32::consts::FRAC_1_PI;

/// Cubic spline (M4), normalised over its support radius `h`.
#[inline]
pub fn w_cubic(r: f32, h: f32) -> f32 {
    let q = r / h;
    let sigma = 8.0 * FRAC_1_PI / (h * h * h);
    if q <= 0.5 {
        sigma * (1.0 - 6.0 * q * q + 6.0 * q * q * q)
    } else if q <= 1.0 {
        let u = 1.0 - q;
        sigma * 2.0 * u * u * u
    } else {
        0.0
    }
}

/// Radial derivative of the cubic spline.
#[inline]
pub fn dw_cubic(r: f32, h: f32) -> f32 {
    let q = r / h;
    let sigma = 8.0 * FRAC_1_PI / (h * h * h * h);
    if q <= 0.5 {
        sigma * (-12.0 * q + 18.0 * q * q)
    } else if q <= 1.0 {
        let u = 1.0 - q;
        sigma * (-6.0) * u * u
    } else {
        0.0
    }
}

/// Tait pressure, stiffness `B = rho0 * c^2 / gamma` with `gamma = 7`.
#[inline]
pub fn tait_pressure(rho: f32, rho0: f32, sound_speed: f32) -> f32 {
    let b = rho0 * sound_speed * sound_speed / 7.0;
    let w = rho / rho0;
    let w2 = w * w;
    b * (w2 * w2 * w2 * w - 1.0)
}

/// Zero the accumulators the kernels write, ahead of a graph run.
pub fn reset_accumulators(parts: &mut [Part]) {
    for p in parts.iter_mut() {
        p.rho = 0.0;
        p.wcount = 0.0;
        p.pressure = 0.0;
        p.a = [0.0; 3];
    }
}

pub struct SphKernels {
    pub rest_density: f32,
    pub sound_speed: f32,
}

impl Default for SphKernels {
    fn default() -> SphKernels {
        SphKernels {
            rest_density: 1000.0,
            sound_speed: 10.0,
        }
    }
}

impl SphKernels {
    #[inline]
    fn density_gather(pi: &mut Part, xj: &V3, mj: f32) {
        let dx = pi.x - xj;
        let r2 = dx.norm_squared() as f32;
        let h2 = pi.h * pi.h;
        if r2 < h2 {
            let r = r2.sqrt();
            pi.rho += mj * w_cubic(r, pi.h);
            pi.wcount += w_cubic(r, pi.h);
        }
    }

    /// Pressure-force gather onto `pi` from a neighbour with state
    /// `(xj, mj, rhoj, pj)`.
    #[inline]
    fn force_gather(pi: &mut Part, xj: &V3, mj: f32, rhoj: f32, pj: f32) {
        let dx = pi.x - xj;
        let r2 = dx.norm_squared() as f32;
        let h = pi.h;
        if r2 >= h * h || r2 == 0.0 || rhoj <= 0.0 || pi.rho <= 0.0 {
            return;
        }
        let r = r2.sqrt();
        let grad = dw_cubic(r, h);
        let coef = -mj * (pi.pressure / (pi.rho * pi.rho) + pj / (rhoj * rhoj)) * grad;
        for k in 0..3 {
            pi.a[k] += coef * (dx[k] as f32) / r;
        }
    }
}

impl Kernels for SphKernels {
    fn density_self(&self, ci: CellView) {
        let n = ci.parts.len();
        for i in 0..n {
            let (xi, hi) = (ci.parts[i].x, ci.parts[i].h);
            let mut rho = 0.0f32;
            let mut wcount = 0.0f32;
            for j in 0..n {
                let dx = xi - ci.parts[j].x;
                let r2 = dx.norm_squared() as f32;
                if r2 < hi * hi {
                    let w = w_cubic(r2.sqrt(), hi);
                    rho += ci.parts[j].mass * w;
                    wcount += w;
                }
            }
            ci.parts[i].rho += rho;
            ci.parts[i].wcount += wcount;
        }
    }

    fn density_pair(&self, ci: CellView, cj: CellView, sid: usize, shift: V3) {
        let ax = AXES[sid];
        let dshift = shift[0] * ax[0] + shift[1] * ax[1] + shift[2] * ax[2];
        let si = ci.sort.expect("pair kernel without a sorted view");
        let sj = cj.sort.expect("pair kernel without a sorted view");

        // Gather into ci: cj sits on the positive side, so for particle i
        // only the leading window of cj's sorted stream can be in range.
        for ei in si.iter() {
            let i = ei.i as usize;
            let hi = ci.parts[i].h;
            for ej in sj.iter() {
                if ej.d + dshift - ei.d > hi as f64 {
                    break;
                }
                let j = ej.i as usize;
                let xj = cj.parts[j].x + shift;
                Self::density_gather(&mut ci.parts[i], &xj, cj.parts[j].mass);
            }
        }

        // Gather into cj, walking ci's stream from the far end.
        for ej in sj.iter() {
            let j = ej.i as usize;
            let hj = cj.parts[j].h;
            for ei in si.iter().rev() {
                if ej.d + dshift - ei.d > hj as f64 {
                    break;
                }
                let i = ei.i as usize;
                let xi = ci.parts[i].x - shift;
                Self::density_gather(&mut cj.parts[j], &xi, ci.parts[i].mass);
            }
        }
    }

    fn force_self(&self, ci: CellView) {
        let n = ci.parts.len();
        for i in 0..n {
            let (xi, hi, rhoi, pi_press) = {
                let p = &ci.parts[i];
                (p.x, p.h, p.rho, p.pressure)
            };
            if rhoi <= 0.0 {
                continue;
            }
            let mut a = [0.0f32; 3];
            for j in 0..n {
                if j == i {
                    continue;
                }
                let pj = &ci.parts[j];
                let dx = xi - pj.x;
                let r2 = dx.norm_squared() as f32;
                if r2 >= hi * hi || r2 == 0.0 || pj.rho <= 0.0 {
                    continue;
                }
                let r = r2.sqrt();
                let coef = -pj.mass
                    * (pi_press / (rhoi * rhoi) + pj.pressure / (pj.rho * pj.rho))
                    * dw_cubic(r, hi);
                for k in 0..3 {
                    a[k] += coef * (dx[k] as f32) / r;
                }
            }
            for k in 0..3 {
                ci.parts[i].a[k] += a[k];
            }
        }
    }

    fn force_pair(&self, ci: CellView, cj: CellView, sid: usize, shift: V3) {
        let ax = AXES[sid];
        let dshift = shift[0] * ax[0] + shift[1] * ax[1] + shift[2] * ax[2];
        let si = ci.sort.expect("pair kernel without a sorted view");
        let sj = cj.sort.expect("pair kernel without a sorted view");

        for ei in si.iter() {
            let i = ei.i as usize;
            let hi = ci.parts[i].h;
            for ej in sj.iter() {
                if ej.d + dshift - ei.d > hi as f64 {
                    break;
                }
                let j = ej.i as usize;
                let xj = cj.parts[j].x + shift;
                let (mj, rhoj, pj) = (cj.parts[j].mass, cj.parts[j].rho, cj.parts[j].pressure);
                Self::force_gather(&mut ci.parts[i], &xj, mj, rhoj, pj);
            }
        }
        for ej in sj.iter() {
            let j = ej.i as usize;
            let hj = cj.parts[j].h;
            for ei in si.iter().rev() {
                if ej.d + dshift - ei.d > hj as f64 {
                    break;
                }
                let i = ei.i as usize;
                let xi = ci.parts[i].x - shift;
                let (mi, rhoi, pi_press) = (ci.parts[i].mass, ci.parts[i].rho, ci.parts[i].pressure);
                Self::force_gather(&mut cj.parts[j], &xi, mi, rhoi, pi_press);
            }
        }
    }

    fn ghost(&self, ci: CellView) {
        for p in ci.parts.iter_mut() {
            p.pressure = tait_pressure(p.rho, self.rest_density, self.sound_speed);
        }
    }
}

#[test]
fn cubic_kernel_integrates_to_one() {
    let h = 0.25f32;
    let grid = 80;
    let step = 2.0 * h / grid as f32;
    let vol = step * step * step;

    let mut integral = 0.0f64;
    for ix in 0..grid {
        for iy in 0..grid {
            for iz in 0..grid {
                let x = (ix as f32 + 0.5) * step - h;
                let y = (iy as f32 + 0.5) * step - h;
                let z = (iz as f32 + 0.5) * step - h;
                let r = (x * x + y * y + z * z).sqrt();
                integral += (w_cubic(r, h) * vol) as f64;
            }
        }
    }
    println!("cubic spline integral over support: {}", integral);
    assert!((integral - 1.0).abs() < 5e-3);
}

#[test]
fn cubic_kernel_derivative_matches_finite_difference() {
    let h = 0.3f32;
    for step in 1..100 {
        let r = step as f32 / 100.0 * h;
        let eps = 1e-4f32 * h;
        let numeric = (w_cubic(r + eps, h) - w_cubic(r - eps, h)) / (2.0 * eps);
        let analytic = dw_cubic(r, h);
        assert!(
            (numeric - analytic).abs() <= 2e-2 * (analytic.abs() + 1.0),
            "r={} numeric={} analytic={}",
            r,
            numeric,
            analytic
        );
    }
}

#[test]
fn tait_pressure_vanishes_at_rest_density() {
    assert_eq!(tait_pressure(1000.0, 1000.0, 10.0), 0.0);
    assert!(tait_pressure(1100.0, 1000.0, 10.0) > 0.0);
    assert!(tait_pressure(900.0, 1000.0, 10.0) < 0.0);
}
