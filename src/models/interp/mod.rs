//! Non-parametric surfaces over the implied vol point cloud.
//!
//! Every interpolator is built from de-duplicated [`ImpliedVolPoint`]s and answers
//! annualised implied volatility at arbitrary (strike, maturity) coordinates. Domain
//! checks are left to [`crate::surface::VolatilitySurface`]; the interpolators
//! themselves extrapolate (flat or nearest-sample) whenever asked.

pub mod mesh;
pub mod rbf;
pub mod spline;
pub mod trisurf;

use std::fmt::Debug;

use crate::calibration::types::ImpliedVolPoint;

pub use mesh::MeshSurface;
pub use rbf::{RbfKernel, RbfSurface};
pub use trisurf::TriSurface;

/// A fitted vol surface that can be evaluated anywhere.
pub trait SurfaceInterpolator: Send + Sync + Debug {
    /// Short label for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Implied volatility at `(strike, maturity)`.
    fn implied_vol(&self, strike: f64, maturity: f64) -> f64;
}

/// Affine map of (strike, maturity) onto the unit square. Axes without spread
/// collapse to 0 so a single-maturity cloud stays one-dimensional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct UnitScaler {
    k_min: f64,
    k_span: f64,
    t_min: f64,
    t_span: f64,
}

impl UnitScaler {
    pub(crate) fn fit(points: &[ImpliedVolPoint]) -> Self {
        let (k_min, k_max) = min_max(points.iter().map(|p| p.strike));
        let (t_min, t_max) = min_max(points.iter().map(|p| p.maturity));
        Self {
            k_min,
            k_span: k_max - k_min,
            t_min,
            t_span: t_max - t_min,
        }
    }

    pub(crate) fn scale(&self, strike: f64, maturity: f64) -> [f64; 2] {
        let u = if self.k_span > 0.0 {
            (strike - self.k_min) / self.k_span
        } else {
            0.0
        };
        let v = if self.t_span > 0.0 {
            (maturity - self.t_min) / self.t_span
        } else {
            0.0
        };
        [u, v]
    }

    /// Number of axes with non-zero spread.
    pub(crate) fn active_dims(&self) -> usize {
        usize::from(self.k_span > 0.0) + usize::from(self.t_span > 0.0)
    }
}

pub(crate) fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
