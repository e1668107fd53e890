// src/models/svi/svi_model.rs

//! Stochastic Volatility Inspired (SVI) model implementation
//!
//! The raw SVI parameterisation gives the total implied variance of one maturity
//! slice as a function of log-moneyness k = ln(K/F):
//!
//! w(k) = a + b * (ρ(k-m) + sqrt((k-m)² + σ²))
//!
//! where the parameters are:
//! - a: vertical shift (controls ATM level)
//! - b: slope factor (wing steepness, b >= 0)
//! - ρ: asymmetry parameter (skew, -1 <= ρ <= 1)
//! - m: horizontal shift (smile location)
//! - σ: curvature parameter (controls smile curvature, σ > 0)
//!
//! [`SviSurface`] joins calibrated slices: total variance is linear in maturity at
//! fixed log-moneyness between slices and scales with t/t₁ (flat vol) outside them.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::calibration::types::MATURITY_EPSILON;
use crate::error::{Result, SurfaceError, SurfaceWarning};
use crate::models::traits::SurfaceModel;

/// Slack allowed on the minimum-variance condition after optimisation.
const MIN_VARIANCE_SLACK: f64 = 1e-10;

/// Parameters for the SVI model for a single maturity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SVIParams {
    /// Time to maturity (years)
    pub t: f64,
    /// Vertical shift parameter (controls ATM variance level)
    pub a: f64,
    /// Slope factor (b >= 0)
    pub b: f64,
    /// Asymmetry parameter (skew, in [-1, 1])
    pub rho: f64,
    /// Horizontal shift parameter
    pub m: f64,
    /// Curvature parameter (> 0)
    pub sigma: f64,
}

/// Validate SVI parameters for mathematical and no-arbitrage constraints.
fn validate_svi_params(t: f64, a: f64, b: f64, rho: f64, m: f64, sigma: f64) -> Result<()> {
    if t <= 0.0 || !t.is_finite() {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: time to expiry (t={t}) must be > 0 and finite"
        )));
    }
    // 'a' may be negative; the minimum-variance condition below keeps w >= 0.
    if !a.is_finite() || !m.is_finite() {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: a={a} and m={m} must be finite"
        )));
    }
    if b < 0.0 || !b.is_finite() {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: parameter b (b={b}) must be >= 0 and finite"
        )));
    }
    if !(-1.0..=1.0).contains(&rho) {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: parameter rho (rho={rho}) must be in [-1, 1]"
        )));
    }
    if sigma <= 0.0 || !sigma.is_finite() {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: parameter sigma (sigma={sigma}) must be > 0 and finite"
        )));
    }

    // a + b*sigma*sqrt(1-rho^2) is the minimum of w(k)
    let min_variance = a + b * sigma * (1.0 - rho * rho).sqrt();
    if min_variance < -MIN_VARIANCE_SLACK {
        return Err(SurfaceError::invalid(format!(
            "SVIParams: a + b*sigma*sqrt(1-rho^2) = {min_variance:.3e} < 0"
        )));
    }

    Ok(())
}

impl SVIParams {
    /// Creates new SVI parameters with validation.
    pub fn new(t: f64, a: f64, b: f64, rho: f64, m: f64, sigma: f64) -> Result<Self> {
        validate_svi_params(t, a, b, rho, m, sigma)?;
        Ok(Self {
            t,
            a,
            b,
            rho,
            m,
            sigma,
        })
    }

    /// Parameters from an optimiser vector `[a, b, rho, m, sigma]`.
    pub fn from_slice(t: f64, x: &[f64]) -> Result<Self> {
        match x {
            [a, b, rho, m, sigma] => Self::new(t, *a, *b, *rho, *m, *sigma),
            _ => Err(SurfaceError::invalid(format!(
                "SVI expects 5 parameters, got {}",
                x.len()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_svi_params(self.t, self.a, self.b, self.rho, self.m, self.sigma)
    }

    /// Minimum total variance over all k.
    pub fn min_total_variance(&self) -> f64 {
        self.a + self.b * self.sigma * (1.0 - self.rho * self.rho).sqrt()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.a, self.b, self.rho, self.m, self.sigma]
    }
}

/// One calibrated maturity slice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SVISlice {
    pub params: SVIParams,
}

impl SVISlice {
    pub fn new(params: SVIParams) -> Self {
        Self { params }
    }

    pub fn maturity(&self) -> f64 {
        self.params.t
    }

    /// w(k) = a + b * (ρ(k-m) + sqrt((k-m)² + σ²))
    pub fn total_variance_at_k(&self, k: f64) -> f64 {
        let p = &self.params;
        let km = k - p.m;
        p.a + p.b * (p.rho * km + (km * km + p.sigma * p.sigma).sqrt())
    }

    /// dw/dk
    pub fn first_derivative(&self, k: f64) -> f64 {
        let p = &self.params;
        let km = k - p.m;
        p.b * (p.rho + km / (km * km + p.sigma * p.sigma).sqrt())
    }

    /// d²w/dk², non-negative whenever b >= 0
    pub fn second_derivative(&self, k: f64) -> f64 {
        let p = &self.params;
        let km = k - p.m;
        let r2 = km * km + p.sigma * p.sigma;
        p.b * p.sigma * p.sigma / (r2 * r2.sqrt())
    }

    /// Annualised implied volatility at log-moneyness `k`.
    pub fn implied_vol(&self, k: f64) -> f64 {
        (self.total_variance_at_k(k).max(0.0) / self.params.t).sqrt()
    }

    /// Gatheral's density function
    /// g(k) = (1 - k w'/(2w))² - (w')²/4 (1/w + 1/4) + w''/2.
    /// Negative values indicate butterfly arbitrage.
    pub fn g_function(&self, k: f64) -> f64 {
        let w = self.total_variance_at_k(k);
        let w1 = self.first_derivative(k);
        let w2 = self.second_derivative(k);
        if w <= 0.0 {
            return f64::NEG_INFINITY;
        }
        let term1 = 1.0 - k * w1 / (2.0 * w);
        term1 * term1 - (w1 * w1 / 4.0) * (1.0 / w + 0.25) + w2 / 2.0
    }

    fn check_time(&self, t: f64) -> Result<()> {
        if (t - self.params.t).abs() > MATURITY_EPSILON {
            return Err(SurfaceError::invalid(format!(
                "SVISlice time mismatch: requested t={t} for slice t={}",
                self.params.t
            )));
        }
        Ok(())
    }
}

impl SurfaceModel for SVISlice {
    type Parameters = SVIParams;

    fn parameters(&self) -> &Self::Parameters {
        &self.params
    }

    fn validate_params(&self) -> Result<()> {
        self.params.validate()
    }

    /// Requires `t` to match the slice maturity.
    fn total_variance(&self, k: f64, t: f64) -> Result<f64> {
        self.check_time(t)?;
        if !k.is_finite() {
            return Err(SurfaceError::invalid(format!(
                "log-moneyness must be finite (k={k})"
            )));
        }
        Ok(self.total_variance_at_k(k).max(0.0))
    }

    /// Not applicable to a single slice.
    fn check_calendar_arbitrage(&self, _k: f64, _t1: f64, _t2: f64) -> Result<()> {
        Ok(())
    }

    fn check_butterfly_arbitrage_at_k(&self, k: f64, t: f64) -> Result<()> {
        const TOLERANCE: f64 = 1e-9;
        self.check_time(t)?;
        let w = self.total_variance_at_k(k);
        if w <= TOLERANCE {
            return Ok(());
        }
        let g = self.g_function(k);
        if g < -TOLERANCE {
            return Err(SurfaceError::invalid(format!(
                "butterfly arbitrage at k={k:.6}, t={t:.4}: g(k) = {g:.6e} < 0"
            )));
        }
        Ok(())
    }
}

/// Full SVI surface across maturities.
#[derive(Debug, Clone, Serialize)]
pub struct SviSurface {
    /// Slices sorted by maturity
    slices: Vec<SVISlice>,
    calendar_arbitrage_tolerance: f64,
}

impl SviSurface {
    /// Sorts slices by maturity and validates each of them.
    pub fn new(mut slices: Vec<SVISlice>, calendar_arbitrage_tolerance: f64) -> Result<Self> {
        if slices.is_empty() {
            return Err(SurfaceError::EmptySurface {
                slices_attempted: 0,
            });
        }
        slices.sort_by(|a, b| a.params.t.total_cmp(&b.params.t));
        for pair in slices.windows(2) {
            if (pair[1].params.t - pair[0].params.t).abs() < MATURITY_EPSILON {
                return Err(SurfaceError::invalid(format!(
                    "duplicate SVI slice maturity {}",
                    pair[0].params.t
                )));
            }
        }
        for s in &slices {
            s.validate_params()?;
        }
        Ok(Self {
            slices,
            calendar_arbitrage_tolerance,
        })
    }

    pub fn slices(&self) -> &[SVISlice] {
        &self.slices
    }

    pub fn maturities(&self) -> Vec<f64> {
        self.slices.iter().map(|s| s.params.t).collect()
    }

    /// Total variance at log-moneyness `k` and maturity `t` (t > 0).
    pub fn total_variance_at(&self, k: f64, t: f64) -> f64 {
        let n = self.slices.len();
        let first = &self.slices[0];
        let last = &self.slices[n - 1];
        if t <= first.params.t {
            return first.total_variance_at_k(k).max(0.0) * t / first.params.t;
        }
        if t >= last.params.t {
            return last.total_variance_at_k(k).max(0.0) * t / last.params.t;
        }
        let idx = self.slices.partition_point(|s| s.params.t < t);
        let (lo, hi) = (&self.slices[idx - 1], &self.slices[idx]);
        let (t1, t2) = (lo.params.t, hi.params.t);
        let w1 = lo.total_variance_at_k(k).max(0.0);
        let w2 = hi.total_variance_at_k(k).max(0.0);
        w1 + (w2 - w1) * (t - t1) / (t2 - t1)
    }

    pub fn implied_vol(&self, k: f64, t: f64) -> f64 {
        (self.total_variance_at(k, t) / t).sqrt()
    }

    /// Compare adjacent slices on `k_grid`; every point where total variance
    /// decreases with maturity becomes a warning.
    pub fn calendar_warnings(&self, k_grid: &[f64]) -> Vec<SurfaceWarning> {
        let mut warnings = Vec::new();
        for pair in self.slices.windows(2) {
            let (s1, s2) = (&pair[0], &pair[1]);
            for &k in k_grid {
                let w1 = s1.total_variance_at_k(k);
                let w2 = s2.total_variance_at_k(k);
                if w2 < w1 - self.calendar_arbitrage_tolerance {
                    warn!(
                        t1 = s1.params.t,
                        t2 = s2.params.t,
                        k,
                        w1,
                        w2,
                        "calendar arbitrage between SVI slices"
                    );
                    warnings.push(SurfaceWarning::CalendarArbitrage {
                        log_moneyness: k,
                        t1: s1.params.t,
                        t2: s2.params.t,
                        w1,
                        w2,
                    });
                }
            }
        }
        warnings
    }
}

impl SurfaceModel for SviSurface {
    type Parameters = Vec<SVISlice>;

    fn parameters(&self) -> &Self::Parameters {
        &self.slices
    }

    fn validate_params(&self) -> Result<()> {
        for s in &self.slices {
            s.validate_params()?;
        }
        Ok(())
    }

    fn total_variance(&self, k: f64, t: f64) -> Result<f64> {
        if !k.is_finite() || !t.is_finite() || t <= 0.0 {
            return Err(SurfaceError::invalid(format!(
                "total variance needs finite k and t > 0 (k={k}, t={t})"
            )));
        }
        Ok(self.total_variance_at(k, t))
    }

    fn check_calendar_arbitrage(&self, k: f64, t1: f64, t2: f64) -> Result<()> {
        if t1 >= t2 {
            return Err(SurfaceError::invalid(format!(
                "calendar check requires t1 < t2, got t1={t1}, t2={t2}"
            )));
        }
        let w1 = self.total_variance(k, t1)?;
        let w2 = self.total_variance(k, t2)?;
        if w2 < w1 - self.calendar_arbitrage_tolerance {
            return Err(SurfaceError::invalid(format!(
                "calendar arbitrage at k={k:.6}: w(t1={t1:.4})={w1:.6} > w(t2={t2:.4})={w2:.6}"
            )));
        }
        Ok(())
    }

    /// Checked on the nearest calibrated slice; interpolated maturities have no
    /// SVI parameters of their own.
    fn check_butterfly_arbitrage_at_k(&self, k: f64, t: f64) -> Result<()> {
        let nearest = self
            .slices
            .iter()
            .min_by(|a, b| (a.params.t - t).abs().total_cmp(&(b.params.t - t).abs()))
            .ok_or(SurfaceError::EmptySurface {
                slices_attempted: 0,
            })?;
        nearest.check_butterfly_arbitrage_at_k(k, nearest.params.t)
    }
}
