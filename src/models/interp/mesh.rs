//! Mesh surface: a natural cubic spline through each maturity slice in strike,
//! joined across maturities by a natural cubic spline in total variance.
//!
//! With smoothing enabled each slice is first replaced by its least-squares
//! polynomial of the configured order, which trades exact reproduction of the
//! samples for a less jagged smile.

use crate::calibration::types::{dedup_points, group_points, ImpliedVolPoint};
use crate::error::{Result, SurfaceError};
use crate::models::interp::spline::{linear_interp, NaturalCubicSpline, PolyFit};
use crate::models::interp::SurfaceInterpolator;

#[derive(Debug, Clone)]
struct MeshSlice {
    maturity: f64,
    smile: NaturalCubicSpline,
}

#[derive(Debug, Clone)]
pub struct MeshSurface {
    slices: Vec<MeshSlice>,
    smoothed: bool,
}

impl MeshSurface {
    /// `smoothing = Some(order)` fits a polynomial of that order to each slice first.
    pub fn new(points: &[ImpliedVolPoint], smoothing: Option<usize>) -> Result<Self> {
        let points = dedup_points(points);
        if points.is_empty() {
            return Err(SurfaceError::insufficient(1, 0, "mesh surface"));
        }

        let mut slices = Vec::new();
        for vs in group_points(&points) {
            let strikes: Vec<f64> = vs.points.iter().map(|p| p.strike).collect();
            let mut vols: Vec<f64> = vs.points.iter().map(|p| p.implied_vol).collect();
            if let Some(order) = smoothing {
                if strikes.len() > 2 {
                    let poly = PolyFit::fit(&strikes, &vols, order)?;
                    for (v, k) in vols.iter_mut().zip(&strikes) {
                        *v = poly.eval(*k).max(0.0);
                    }
                }
            }
            slices.push(MeshSlice {
                maturity: vs.maturity,
                smile: NaturalCubicSpline::new(strikes, vols)?,
            });
        }

        Ok(Self {
            slices,
            smoothed: smoothing.is_some(),
        })
    }

    pub fn maturities(&self) -> Vec<f64> {
        self.slices.iter().map(|s| s.maturity).collect()
    }

    pub fn is_smoothed(&self) -> bool {
        self.smoothed
    }

    /// Total variance at `strike` and `maturity`.
    pub fn total_variance(&self, strike: f64, maturity: f64) -> f64 {
        let ts: Vec<f64> = self.maturities();
        let ws: Vec<f64> = self
            .slices
            .iter()
            .map(|s| {
                let v = s.smile.eval(strike).max(0.0);
                v * v * s.maturity
            })
            .collect();

        let n = ts.len();
        if maturity <= ts[0] {
            return ws[0] * maturity / ts[0];
        }
        if maturity >= ts[n - 1] {
            return ws[n - 1] * maturity / ts[n - 1];
        }
        match NaturalCubicSpline::new(ts.clone(), ws.clone()) {
            Ok(term) => term.eval(maturity).max(0.0),
            Err(_) => linear_interp(&ts, &ws, maturity),
        }
    }
}

impl SurfaceInterpolator for MeshSurface {
    fn name(&self) -> &'static str {
        "mesh"
    }

    fn implied_vol(&self, strike: f64, maturity: f64) -> f64 {
        if maturity <= 0.0 {
            return f64::NAN;
        }
        (self.total_variance(strike, maturity) / maturity).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::types::OptionType;
    use approx::assert_relative_eq;

    fn pt(k: f64, t: f64, v: f64) -> ImpliedVolPoint {
        ImpliedVolPoint::new(k, t, 100.0, v, OptionType::Call)
    }

    fn smile(k: f64, t: f64) -> f64 {
        let m = (k / 100.0f64).ln();
        0.2 + 0.4 * m * m - 0.15 * m - 0.01 * t
    }

    fn grid() -> Vec<ImpliedVolPoint> {
        let mut pts = Vec::new();
        for &t in &[0.1, 0.25, 0.5, 1.0] {
            for &k in &[80.0, 90.0, 100.0, 110.0, 120.0] {
                pts.push(pt(k, t, smile(k, t)));
            }
        }
        pts
    }

    #[test]
    fn reproduces_samples() {
        let pts = grid();
        let mesh = MeshSurface::new(&pts, None).unwrap();
        for p in &pts {
            assert_relative_eq!(
                mesh.implied_vol(p.strike, p.maturity),
                p.implied_vol,
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn flat_vol_outside_maturity_range() {
        let mesh = MeshSurface::new(&grid(), None).unwrap();
        assert_relative_eq!(mesh.implied_vol(100.0, 0.05), smile(100.0, 0.1), epsilon = 1e-12);
        assert_relative_eq!(mesh.implied_vol(100.0, 2.0), smile(100.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn single_slice_is_flat_in_maturity() {
        let pts: Vec<_> = grid().into_iter().filter(|p| p.maturity == 0.25).collect();
        let mesh = MeshSurface::new(&pts, None).unwrap();
        assert_relative_eq!(
            mesh.implied_vol(110.0, 0.25),
            smile(110.0, 0.25),
            epsilon = 1e-12
        );
        assert_relative_eq!(mesh.implied_vol(110.0, 0.6), smile(110.0, 0.25), epsilon = 1e-12);
    }

    #[test]
    fn smoothing_removes_noise() {
        let mut pts = grid();
        // jitter alternate strikes
        for (i, p) in pts.iter_mut().enumerate() {
            if i % 2 == 0 {
                p.implied_vol += 0.01;
            }
        }
        let raw = MeshSurface::new(&pts, None).unwrap();
        let smooth = MeshSurface::new(&pts, Some(2)).unwrap();
        assert!(smooth.is_smoothed());
        let k = 95.0;
        let t = 0.5;
        let truth = smile(k, t);
        let raw_err = (raw.implied_vol(k, t) - truth).abs();
        assert!((smooth.implied_vol(k, t) - truth).abs() <= raw_err + 0.01);
    }
}
