// src/models/svi/svi_calibrator.rs

//! SVI calibrator
//!
//! Fits one [`SVISlice`] per maturity by minimising the squared total-variance error
//! against the solved implied vols, using the bounded optimiser pipeline in
//! [`crate::calibration::pipeline`]. Slices are independent and calibrated in
//! parallel; the surface is assembled once all of them are back.

use std::any::Any;

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, warn};

use crate::calibration::config::SviConfig;
use crate::calibration::pipeline::{CalibrationOutcome, CalibrationProcess};
use crate::calibration::types::{check_maturity, ModelCalibrator, VolSlice};
use crate::error::{Result, SurfaceError, SurfaceWarning};
use crate::models::svi::svi_model::{SVIParams, SVISlice};

/// Minimum number of distinct strikes needed to calibrate a slice.
pub const MIN_SVI_POINTS: usize = 3;

/// Parameter bounds for SVI calibration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SVIParamBounds {
    /// Vertical shift parameter bounds
    pub a: (f64, f64),
    /// Slope factor bounds (lower bound >= 0)
    pub b: (f64, f64),
    /// Asymmetry parameter bounds, inside [-1, 1]
    pub rho: (f64, f64),
    /// Horizontal shift parameter bounds
    pub m: (f64, f64),
    /// Curvature parameter bounds (lower bound > 0)
    pub sigma: (f64, f64),
}

impl Default for SVIParamBounds {
    fn default() -> Self {
        Self {
            a: (-1.0, 2.0),
            b: (0.0, 5.0),
            rho: (-0.999, 0.999),
            m: (-2.0, 2.0),
            sigma: (1e-4, 3.0),
        }
    }
}

impl From<&[(f64, f64)]> for SVIParamBounds {
    fn from(bounds: &[(f64, f64)]) -> Self {
        match bounds {
            [a, b, rho, m, sigma] => Self {
                a: *a,
                b: *b,
                rho: *rho,
                m: *m,
                sigma: *sigma,
            },
            _ => Self::default(),
        }
    }
}

impl SVIParamBounds {
    pub fn to_vec(&self) -> Vec<(f64, f64)> {
        vec![self.a, self.b, self.rho, self.m, self.sigma]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, (lo, hi)) in ["a", "b", "rho", "m", "sigma"].iter().zip(self.to_vec()) {
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(SurfaceError::invalid(format!(
                    "SVI bound for {name} must be finite with lower < upper, got ({lo}, {hi})"
                )));
            }
        }
        if self.b.0 < 0.0 || self.sigma.0 <= 0.0 || self.rho.0 < -1.0 || self.rho.1 > 1.0 {
            return Err(SurfaceError::invalid(
                "SVI bounds require b >= 0, sigma > 0 and rho within [-1, 1]",
            ));
        }
        Ok(())
    }
}

/// Calibrator for one SVI slice: parameters `[a, b, rho, m, sigma]`.
#[derive(Debug, Clone)]
pub struct SviSliceCalibrator {
    maturity: f64,
    log_moneyness: Vec<f64>,
    total_variance: Vec<f64>,
    /// Scale used to normalise the objective
    mean_variance: f64,
    param_bounds: Vec<(f64, f64)>,
    penalty_weight: f64,
}

impl SviSliceCalibrator {
    pub fn new(slice: &VolSlice, bounds: &SVIParamBounds, penalty_weight: f64) -> Result<Self> {
        check_maturity(slice.maturity)?;
        let log_moneyness = slice.log_moneyness();
        let total_variance = slice.total_variances();

        let mut distinct = log_moneyness.clone();
        distinct.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        if distinct.len() < MIN_SVI_POINTS {
            return Err(SurfaceError::insufficient(
                MIN_SVI_POINTS,
                distinct.len(),
                format!("SVI slice t={:.4}", slice.maturity),
            ));
        }
        if let Some(bad) = total_variance.iter().find(|w| !w.is_finite() || **w <= 0.0) {
            return Err(SurfaceError::invalid(format!(
                "SVI slice t={} has non-positive total variance {bad}",
                slice.maturity
            )));
        }
        bounds.validate()?;

        let mean_variance = total_variance.iter().mean();
        Ok(Self {
            maturity: slice.maturity,
            log_moneyness,
            total_variance,
            mean_variance,
            param_bounds: bounds.to_vec(),
            penalty_weight,
        })
    }

    pub fn maturity(&self) -> f64 {
        self.maturity
    }

    /// Heuristic starting point from a least-squares quadratic w ≈ c0 + c1 k + c2 k².
    ///
    /// Near the vertex, SVI behaves like `a + bσ + bρ k + b k²/(2σ)`, so with σ fixed
    /// the level, slope and curvature give `a`, `ρ` and `b`. A flat slice lands on
    /// `b = 0, ρ = 0, a = w`.
    pub fn initial_estimate(&self, sigma0: f64) -> Vec<f64> {
        let n = self.log_moneyness.len();
        let design = DMatrix::from_fn(n, 3, |i, j| self.log_moneyness[i].powi(j as i32));
        let rhs = DVector::from_column_slice(&self.total_variance);
        let coeffs = design
            .svd(true, true)
            .solve(&rhs, 1e-14)
            .map(|c| (c[0], c[1], c[2]))
            .unwrap_or((self.mean_variance, 0.0, 0.0));
        let (c0, c1, c2) = coeffs;

        let sigma = sigma0.max(1e-4);
        let mut b = (2.0 * sigma * c2).max(c1.abs());
        let mut rho = if b > 0.0 { (c1 / b).clamp(-1.0, 1.0) } else { 0.0 };
        if b < 1e-8 {
            b = 0.0;
            rho = 0.0;
        }
        let mut a = c0 - b * sigma;
        let floor = -b * sigma * (1.0 - rho * rho).sqrt();
        if a < floor {
            a = floor;
        }

        let mut x = vec![a, b, rho, 0.0, sigma];
        for (v, &(lo, hi)) in x.iter_mut().zip(&self.param_bounds) {
            *v = v.clamp(lo, hi);
        }
        x
    }

    /// Model minus observed total variance at each calibration strike.
    pub fn residuals(&self, slice: &SVISlice) -> Vec<f64> {
        self.log_moneyness
            .iter()
            .zip(&self.total_variance)
            .map(|(&k, &w)| slice.total_variance_at_k(k) - w)
            .collect()
    }

    /// Root-mean-square implied vol error of a fitted slice.
    pub fn vol_rmse(&self, slice: &SVISlice) -> f64 {
        let errors: Vec<f64> = self
            .log_moneyness
            .iter()
            .zip(&self.total_variance)
            .map(|(&k, &w)| slice.implied_vol(k) - (w / self.maturity).sqrt())
            .collect();
        errors.iter().quadratic_mean()
    }

    /// Turn an optimiser vector into valid parameters, lifting `a` if the soft
    /// non-negativity penalty left a tiny violation.
    fn to_params(&self, x: &[f64]) -> Result<SVIParams> {
        let mut x = x.to_vec();
        if let [a, b, rho, _, sigma] = x.as_mut_slice() {
            *rho = rho.clamp(-1.0, 1.0);
            *b = b.max(0.0);
            let min_var = *a + *b * *sigma * (1.0 - *rho * *rho).sqrt();
            if min_var < 0.0 {
                *a -= min_var;
            }
        }
        SVIParams::from_slice(self.maturity, &x)
    }

    /// Package an optimiser outcome. The objective is re-evaluated on the final
    /// parameters, which may differ from the optimiser's vector after `to_params`.
    pub fn slice_fit(&self, outcome: &CalibrationOutcome, points: usize) -> Result<SliceFit> {
        let params = self.to_params(&outcome.params)?;
        let slice = SVISlice::new(params);
        Ok(SliceFit {
            slice,
            objective: self.evaluate_objective(&params.to_vec()),
            vol_rmse: self.vol_rmse(&slice),
            iterations: outcome.iterations,
            status: if outcome.converged {
                CalibrationStatus::Converged
            } else {
                CalibrationStatus::Nonconvergent
            },
            points,
        })
    }
}

impl ModelCalibrator for SviSliceCalibrator {
    fn model_name(&self) -> &str {
        "svi"
    }

    fn param_count(&self) -> usize {
        self.param_bounds.len()
    }

    fn param_bounds(&self) -> &[(f64, f64)] {
        &self.param_bounds
    }

    /// Mean squared total-variance error normalised by the mean observed variance,
    /// plus a quadratic penalty on negative variance.
    fn evaluate_objective(&self, x: &[f64]) -> f64 {
        let [a, b, rho, m, sigma] = match x {
            [a, b, rho, m, sigma] => [*a, *b, *rho, *m, *sigma],
            _ => return 1.0e12,
        };
        if !(sigma > 0.0) || x.iter().any(|v| !v.is_finite()) {
            return 1.0e12;
        }

        let scale = self.mean_variance;
        let n = self.log_moneyness.len() as f64;
        let mut sse = 0.0;
        let mut penalty = 0.0;
        for (&k, &w_obs) in self.log_moneyness.iter().zip(&self.total_variance) {
            let km = k - m;
            let w = a + b * (rho * km + (km * km + sigma * sigma).sqrt());
            let d = (w - w_obs) / scale;
            sse += d * d;
            if w < 0.0 {
                penalty += (w / scale).powi(2);
            }
        }

        let min_var = a + b * sigma * (1.0 - rho * rho).max(0.0).sqrt();
        if min_var < 0.0 {
            penalty += (min_var / scale).powi(2);
        }

        sse / n + self.penalty_weight * penalty
    }

    fn param_names(&self) -> Vec<&str> {
        vec!["a", "b", "rho", "m", "sigma"]
    }

    fn expand_bounds_if_needed(
        &mut self,
        params: &[f64],
        proximity_threshold: f64,
        expansion_factor: f64,
    ) -> bool {
        let mut adjusted = false;
        for (i, (bounds, param)) in self.param_bounds.iter_mut().zip(params).enumerate() {
            let range = bounds.1 - bounds.0;
            let expansion = range * expansion_factor;
            if *param <= bounds.0 + range * proximity_threshold {
                let lower = match i {
                    1 => (bounds.0 - expansion).max(0.0),
                    2 => (bounds.0 - expansion).max(-1.0),
                    4 => (bounds.0 - expansion).max(1e-6),
                    _ => bounds.0 - expansion,
                };
                if lower < bounds.0 {
                    bounds.0 = lower;
                    adjusted = true;
                }
            }
            if *param >= bounds.1 - range * proximity_threshold {
                let upper = match i {
                    2 => (bounds.1 + expansion).min(1.0),
                    _ => bounds.1 + expansion,
                };
                if upper > bounds.1 {
                    bounds.1 = upper;
                    adjusted = true;
                }
            }
        }
        adjusted
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Whether a slice calibration met its convergence criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationStatus {
    Converged,
    /// Iteration budget exhausted; the best iterate was kept
    Nonconvergent,
}

/// A calibrated slice with its fit statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceFit {
    pub slice: SVISlice,
    pub objective: f64,
    /// RMS implied vol error at the calibration strikes
    pub vol_rmse: f64,
    pub iterations: usize,
    pub status: CalibrationStatus,
    pub points: usize,
}

impl SliceFit {
    pub fn warning(&self) -> Option<SurfaceWarning> {
        match self.status {
            CalibrationStatus::Converged => None,
            CalibrationStatus::Nonconvergent => Some(SurfaceWarning::CalibrationNonconvergent {
                maturity: self.slice.params.t,
                iterations: self.iterations,
                objective: self.objective,
            }),
        }
    }
}

/// Calibrate SVI parameters for one maturity slice.
pub fn calibrate_slice(slice: &VolSlice, config: &SviConfig) -> Result<SliceFit> {
    let calibrator = SviSliceCalibrator::new(slice, &config.bounds, config.penalty_weight)?;
    let guess = if config.compute_initial {
        calibrator.initial_estimate(config.sigma_init)
    } else {
        config.initial_guess().to_vec()
    };
    debug!(
        maturity = slice.maturity,
        points = slice.points.len(),
        ?guess,
        "calibrating SVI slice"
    );

    let outcome = CalibrationProcess::new(Box::new(calibrator.clone()), config.clone())
        .with_initial_guess(guess)
        .run();
    let fit = calibrator.slice_fit(&outcome, slice.points.len())?;
    if fit.status == CalibrationStatus::Nonconvergent {
        warn!(
            maturity = slice.maturity,
            iterations = fit.iterations,
            objective = fit.objective,
            "SVI calibration did not converge, keeping best iterate"
        );
    }
    debug!(
        maturity = slice.maturity,
        objective = fit.objective,
        vol_rmse = fit.vol_rmse,
        "SVI slice calibrated"
    );
    Ok(fit)
}

/// Calibrate every slice independently. Results are in the order of `slices`.
pub fn calibrate_slices(slices: &[VolSlice], config: &SviConfig) -> Vec<Result<SliceFit>> {
    #[cfg(feature = "parallel")]
    let fits = slices
        .par_iter()
        .map(|s| calibrate_slice(s, config))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let fits = slices.iter().map(|s| calibrate_slice(s, config)).collect();
    fits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::types::{ImpliedVolPoint, OptionType};

    fn slice_from(t: f64, params: &SVIParams, ks: &[f64]) -> VolSlice {
        let s = SVISlice::new(*params);
        let points = ks
            .iter()
            .map(|&k| {
                let strike = 100.0 * k.exp();
                ImpliedVolPoint::new(strike, t, 100.0, s.implied_vol(k), OptionType::Call)
            })
            .collect();
        VolSlice {
            maturity: t,
            forward: 100.0,
            points,
        }
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let p = SVIParams::new(0.5, 0.02, 0.1, -0.3, 0.0, 0.2).unwrap();
        let slice = slice_from(0.5, &p, &[-0.1, 0.1]);
        let err = calibrate_slice(&slice, &SviConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            SurfaceError::InsufficientData {
                required: 3,
                found: 2,
                ..
            }
        ));
    }

    #[test]
    fn flat_slice_initial_estimate_is_flat() {
        let p = SVIParams::new(0.25, 0.01, 0.0, 0.0, 0.0, 0.1).unwrap();
        let slice = slice_from(0.25, &p, &[-0.2, -0.1, 0.0, 0.1, 0.2]);
        let cal = SviSliceCalibrator::new(&slice, &SVIParamBounds::default(), 1e4).unwrap();
        let x = cal.initial_estimate(0.1);
        assert!(x[1].abs() < 1e-8, "b = {}", x[1]);
        assert!(x[2].abs() < 1e-8, "rho = {}", x[2]);
        assert!((x[0] - 0.01).abs() < 1e-8);
        assert!(cal.evaluate_objective(&x) < 1e-12);
    }

    #[test]
    fn objective_penalises_negative_variance() {
        let p = SVIParams::new(0.25, 0.01, 0.1, 0.0, 0.0, 0.1).unwrap();
        let slice = slice_from(0.25, &p, &[-0.2, 0.0, 0.2]);
        let cal = SviSliceCalibrator::new(&slice, &SVIParamBounds::default(), 1e4).unwrap();
        let feasible = cal.evaluate_objective(&p.to_vec());
        let infeasible = cal.evaluate_objective(&[-0.5, 0.1, 0.0, 0.0, 0.1]);
        assert!(feasible < 1e-20);
        assert!(infeasible > 1.0);
    }

    #[test]
    fn recovers_known_smile() {
        let p = SVIParams::new(0.5, 0.02, 0.15, -0.4, 0.05, 0.2).unwrap();
        let ks: Vec<f64> = (-8..=8).map(|i| i as f64 * 0.05).collect();
        let slice = slice_from(0.5, &p, &ks);
        let fit = calibrate_slice(&slice, &SviConfig::default()).unwrap();
        assert!(fit.vol_rmse < 5e-3, "rmse {}", fit.vol_rmse);
        let fitted = fit.slice;
        for &k in &ks {
            let diff = (fitted.implied_vol(k) - SVISlice::new(p).implied_vol(k)).abs();
            assert!(diff < 1e-2, "k={k} diff={diff}");
        }
        assert!(fitted.params.b >= 0.0 && fitted.params.rho.abs() <= 1.0);
        assert!(fitted.params.min_total_variance() >= -1e-10);
    }

    #[test]
    fn slice_fit_objective_matches_final_params() {
        let p = SVIParams::new(0.25, 0.01, 0.1, 0.0, 0.0, 0.1).unwrap();
        let slice = slice_from(0.25, &p, &[-0.2, 0.0, 0.2]);
        let cal = SviSliceCalibrator::new(&slice, &SVIParamBounds::default(), 1e4).unwrap();
        // a + b*sigma < 0: a gets lifted onto the minimum-variance boundary
        let x = vec![-0.02, 0.1, 0.0, 0.0, 0.1];
        let outcome = CalibrationOutcome {
            objective: cal.evaluate_objective(&x),
            params: x,
            iterations: 7,
            converged: false,
            bounds: SVIParamBounds::default().to_vec(),
        };
        let fit = cal.slice_fit(&outcome, 3).unwrap();
        assert!((fit.slice.params.a + 0.01).abs() < 1e-12);
        assert!(fit.slice.params.min_total_variance().abs() < 1e-12);
        assert_eq!(fit.objective, cal.evaluate_objective(&fit.slice.params.to_vec()));
        assert!(fit.objective < outcome.objective);
        assert_eq!(fit.status, CalibrationStatus::Nonconvergent);
        assert_eq!(fit.iterations, 7);
        assert!(matches!(
            fit.warning(),
            Some(SurfaceWarning::CalibrationNonconvergent { iterations: 7, .. })
        ));
    }

    #[test]
    fn expand_bounds_respects_rho_limit() {
        let p = SVIParams::new(0.25, 0.01, 0.1, 0.0, 0.0, 0.1).unwrap();
        let slice = slice_from(0.25, &p, &[-0.2, 0.0, 0.2]);
        let mut cal = SviSliceCalibrator::new(&slice, &SVIParamBounds::default(), 1e4).unwrap();
        let adjusted = cal.expand_bounds_if_needed(&[1.99, 0.1, 0.998, 0.0, 0.1], 0.1, 0.25);
        assert!(adjusted);
        assert!(cal.param_bounds()[0].1 > 2.0);
        assert!(cal.param_bounds()[2].1 <= 1.0);
    }
}
