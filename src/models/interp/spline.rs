//! One-dimensional building blocks: natural cubic splines and least-squares
//! polynomial fits.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::error::{Result, SurfaceError};

/// `S(x) = a + b·(x - xᵢ) + c·(x - xᵢ)² + d·(x - xᵢ)³` on \[xᵢ, xᵢ₊₁\].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct SplineCoeff {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
}

/// Natural cubic spline (S'' = 0 at both ends) with flat extrapolation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NaturalCubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    coeffs: Vec<SplineCoeff>,
}

impl NaturalCubicSpline {
    /// `x` must be strictly increasing. Two knots give a straight line; a single
    /// knot gives a constant.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(SurfaceError::invalid(format!(
                "spline knots and values differ in length: {} vs {}",
                x.len(),
                y.len()
            )));
        }
        if x.is_empty() {
            return Err(SurfaceError::insufficient(1, 0, "cubic spline"));
        }
        if let Some(bad) = x.iter().chain(&y).find(|v| !v.is_finite()) {
            return Err(SurfaceError::invalid(format!(
                "spline inputs must be finite, got {bad}"
            )));
        }
        for (i, w) in x.windows(2).enumerate() {
            if w[1] <= w[0] {
                return Err(SurfaceError::invalid(format!(
                    "spline knots must be strictly increasing, but x[{i}]={} >= x[{}]={}",
                    w[0],
                    i + 1,
                    w[1]
                )));
            }
        }
        let coeffs = build_coefficients(&x, &y);
        Ok(Self { x, y, coeffs })
    }

    pub fn knots(&self) -> &[f64] {
        &self.x
    }

    pub fn values(&self) -> &[f64] {
        &self.y
    }

    pub fn eval(&self, x: f64) -> f64 {
        let n = self.x.len();
        if n == 1 || x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[n - 1] {
            return self.y[n - 1];
        }
        let i = self.x.partition_point(|&k| k < x).saturating_sub(1);
        let dx = x - self.x[i];
        let c = &self.coeffs[i];
        c.a + dx * (c.b + dx * (c.c + dx * c.d))
    }
}

/// Thomas-algorithm solve of the natural spline system.
fn build_coefficients(x: &[f64], y: &[f64]) -> Vec<SplineCoeff> {
    let n = x.len();
    if n < 2 {
        return Vec::new();
    }
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

    // second-derivative terms, zero at both ends
    let mut c = vec![0.0; n];
    if n > 2 {
        let m = n - 2;
        let mut diag = vec![0.0; m];
        let mut rhs = vec![0.0; m];
        for j in 0..m {
            let i = j + 1;
            diag[j] = 2.0 * (h[i - 1] + h[i]);
            rhs[j] = 3.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
        }
        for j in 1..m {
            let w = h[j] / diag[j - 1];
            diag[j] -= w * h[j];
            rhs[j] -= w * rhs[j - 1];
        }
        c[m] = rhs[m - 1] / diag[m - 1];
        for j in (0..m - 1).rev() {
            let i = j + 1;
            c[i] = (rhs[j] - h[j + 1] * c[i + 1]) / diag[j];
        }
    }

    (0..n - 1)
        .map(|i| SplineCoeff {
            a: y[i],
            b: (y[i + 1] - y[i]) / h[i] - h[i] * (2.0 * c[i] + c[i + 1]) / 3.0,
            c: c[i],
            d: (c[i + 1] - c[i]) / (3.0 * h[i]),
        })
        .collect()
}

/// Least-squares polynomial in a centred and scaled variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolyFit {
    /// Coefficients of `u = (x - centre) / scale`, constant term first
    coeffs: Vec<f64>,
    centre: f64,
    scale: f64,
}

impl PolyFit {
    /// Fit of degree `order`, capped at `len - 1` so the system is always determined.
    pub fn fit(x: &[f64], y: &[f64], order: usize) -> Result<Self> {
        if x.is_empty() || x.len() != y.len() {
            return Err(SurfaceError::invalid(format!(
                "polyfit needs matching non-empty inputs, got {} and {}",
                x.len(),
                y.len()
            )));
        }
        let degree = order.min(x.len() - 1);
        let (lo, hi) = x
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let centre = 0.5 * (lo + hi);
        let scale = if hi > lo { 0.5 * (hi - lo) } else { 1.0 };

        let design = DMatrix::from_fn(x.len(), degree + 1, |i, j| {
            ((x[i] - centre) / scale).powi(j as i32)
        });
        let rhs = DVector::from_column_slice(y);
        let coeffs = design
            .svd(true, true)
            .solve(&rhs, 1e-12)
            .map_err(|e| SurfaceError::invalid(format!("polyfit failed: {e}")))?;

        Ok(Self {
            coeffs: coeffs.iter().copied().collect(),
            centre,
            scale,
        })
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len() - 1
    }

    pub fn eval(&self, x: f64) -> f64 {
        let u = (x - self.centre) / self.scale;
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * u + c)
    }
}

/// Piecewise-linear interpolation with flat extrapolation; `x` sorted ascending.
pub fn linear_interp(x: &[f64], y: &[f64], at: f64) -> f64 {
    let n = x.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 || at <= x[0] {
        return y[0];
    }
    if at >= x[n - 1] {
        return y[n - 1];
    }
    let i = x.partition_point(|&v| v < at);
    let (x0, x1) = (x[i - 1], x[i]);
    y[i - 1] + (y[i] - y[i - 1]) * (at - x0) / (x1 - x0)
}
