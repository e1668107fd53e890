//! Radial basis function interpolation (the "spline" surface type).
//!
//! Nodes are the de-duplicated samples in unit-scaled (strike, maturity)
//! coordinates. Weights solve `Φ w = σ` with `Φᵢⱼ = φ(‖xᵢ - xⱼ‖)`; an LU solve is
//! tried first and an SVD least-squares solve covers near-singular systems.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::calibration::types::{dedup_points, ImpliedVolPoint};
use crate::error::{Result, SurfaceError};
use crate::models::interp::{SurfaceInterpolator, UnitScaler};

/// Radial kernel, named after the usual option strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RbfKernel {
    Multiquadric,
    Inverse,
    Gaussian,
    Linear,
    Cubic,
    Quintic,
    #[default]
    ThinPlate,
}

impl RbfKernel {
    pub fn eval(self, r: f64, epsilon: f64) -> f64 {
        match self {
            RbfKernel::Multiquadric => ((r / epsilon).powi(2) + 1.0).sqrt(),
            RbfKernel::Inverse => 1.0 / ((r / epsilon).powi(2) + 1.0).sqrt(),
            RbfKernel::Gaussian => (-(r / epsilon).powi(2)).exp(),
            RbfKernel::Linear => r,
            RbfKernel::Cubic => r.powi(3),
            RbfKernel::Quintic => r.powi(5),
            RbfKernel::ThinPlate => {
                if r <= 0.0 {
                    0.0
                } else {
                    r * r * r.ln()
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RbfSurface {
    kernel: RbfKernel,
    epsilon: f64,
    scaler: UnitScaler,
    nodes: Vec<[f64; 2]>,
    weights: Vec<f64>,
}

impl RbfSurface {
    /// `epsilon = None` uses the mean node spacing, `(∏ spans / N)^(1/d)` over
    /// the axes that actually vary.
    pub fn new(
        points: &[ImpliedVolPoint],
        kernel: RbfKernel,
        epsilon: Option<f64>,
    ) -> Result<Self> {
        let points = dedup_points(points);
        if points.is_empty() {
            return Err(SurfaceError::insufficient(1, 0, "RBF surface"));
        }
        let scaler = UnitScaler::fit(&points);
        let nodes: Vec<[f64; 2]> = points
            .iter()
            .map(|p| scaler.scale(p.strike, p.maturity))
            .collect();
        let n = nodes.len();

        let epsilon = match epsilon {
            Some(e) => e,
            None => {
                let dims = scaler.active_dims().max(1) as f64;
                // unit spans, so the product is 1
                (1.0 / n as f64).powf(1.0 / dims)
            }
        };

        let values = DVector::from_iterator(n, points.iter().map(|p| p.implied_vol));
        let weights = if n == 1 {
            // a lone node cannot be expressed through φ(0) for every kernel
            vec![points[0].implied_vol]
        } else {
            let phi = DMatrix::from_fn(n, n, |i, j| {
                kernel.eval(distance(&nodes[i], &nodes[j]), epsilon)
            });
            solve_weights(phi, &values)?
        };

        Ok(Self {
            kernel,
            epsilon,
            scaler,
            nodes,
            weights,
        })
    }

    pub fn kernel(&self) -> RbfKernel {
        self.kernel
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

fn distance(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn solve_weights(phi: DMatrix<f64>, values: &DVector<f64>) -> Result<Vec<f64>> {
    if let Some(w) = phi.clone().lu().solve(values) {
        if w.iter().all(|v| v.is_finite()) {
            return Ok(w.iter().copied().collect());
        }
    }
    let w = phi
        .svd(true, true)
        .solve(values, 1e-12)
        .map_err(|e| SurfaceError::invalid(format!("RBF system could not be solved: {e}")))?;
    if w.iter().any(|v| !v.is_finite()) {
        return Err(SurfaceError::invalid("RBF weights are not finite"));
    }
    Ok(w.iter().copied().collect())
}

impl SurfaceInterpolator for RbfSurface {
    fn name(&self) -> &'static str {
        "rbf"
    }

    fn implied_vol(&self, strike: f64, maturity: f64) -> f64 {
        if self.nodes.len() == 1 {
            return self.weights[0];
        }
        let q = self.scaler.scale(strike, maturity);
        self.nodes
            .iter()
            .zip(&self.weights)
            .map(|(node, w)| w * self.kernel.eval(distance(&q, node), self.epsilon))
            .sum()
    }
}
