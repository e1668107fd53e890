//! The queryable volatility surface.
//!
//! [`VolatilitySurface::build`] runs the whole pipeline for one configuration:
//! chain filter, per-quote implied vol solve, then either per-slice SVI
//! calibration or one of the non-parametric interpolators. The result is
//! immutable; a configuration change means building a new surface.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::calibration::config::{FitMethod, SurfaceConfig, SurfaceType};
use crate::calibration::types::{
    check_maturity, group_points, ForwardCurve, ImpliedVolPoint, MarketInputs, Quote, VolSlice,
};
use crate::chain::{ChainFilter, FilterSummary};
use crate::error::{validate_positive, Result, SurfaceError, SurfaceWarning};
use crate::models::implied::{solve_chain, QuoteFailure};
use crate::models::interp::{min_max, MeshSurface, RbfSurface, SurfaceInterpolator, TriSurface};
use crate::models::svi::svi_calibrator::{calibrate_slices, SliceFit};
use crate::models::svi::svi_model::SviSurface;

const DAYS_PER_YEAR: f64 = 365.0;
/// Log-moneyness points used when scanning adjacent SVI slices for calendar arbitrage.
const CALENDAR_GRID_POINTS: usize = 41;

/// A maturity slice that could not be calibrated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceFailure {
    pub maturity: f64,
    pub points: usize,
    #[serde(skip)]
    pub error: SurfaceError,
    pub reason: String,
}

/// Everything that went wrong, or nearly wrong, while building a surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SurfaceDiagnostics {
    pub filter: FilterSummary,
    pub quote_failures: Vec<QuoteFailure>,
    pub slice_failures: Vec<SliceFailure>,
    pub warnings: Vec<SurfaceWarning>,
}

impl SurfaceDiagnostics {
    /// No failures and no warnings.
    pub fn is_clean(&self) -> bool {
        self.quote_failures.is_empty() && self.slice_failures.is_empty() && self.warnings.is_empty()
    }

    pub fn calendar_warnings(&self) -> impl Iterator<Item = &SurfaceWarning> {
        self.warnings
            .iter()
            .filter(|w| matches!(w, SurfaceWarning::CalendarArbitrage { .. }))
    }
}

/// Fitted (strike, maturity) rectangle plus the tolerance beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SurfaceDomain {
    pub strike_min: f64,
    pub strike_max: f64,
    pub maturity_min: f64,
    pub maturity_max: f64,
    pub strike_tolerance: f64,
    pub maturity_tolerance: f64,
}

impl SurfaceDomain {
    fn from_points(points: &[ImpliedVolPoint], config: &SurfaceConfig) -> Self {
        let (strike_min, strike_max) = min_max(points.iter().map(|p| p.strike));
        let (maturity_min, maturity_max) = min_max(points.iter().map(|p| p.maturity));
        let span = strike_max - strike_min;
        // a single strike still gets a band proportional to its level
        let base = if span > 0.0 { span } else { strike_min };
        Self {
            strike_min,
            strike_max,
            maturity_min,
            maturity_max,
            strike_tolerance: config.domain.strike_tolerance * base,
            maturity_tolerance: config.domain.maturity_tolerance_days / DAYS_PER_YEAR,
        }
    }

    pub fn check(&self, strike: f64, maturity: f64) -> Result<()> {
        let out = |reason: String| SurfaceError::OutOfDomain {
            strike,
            maturity,
            reason,
        };
        if maturity < self.maturity_min - self.maturity_tolerance
            || maturity > self.maturity_max + self.maturity_tolerance
        {
            return Err(out(format!(
                "maturity outside fitted range [{:.4}, {:.4}]",
                self.maturity_min, self.maturity_max
            )));
        }
        if strike < self.strike_min - self.strike_tolerance
            || strike > self.strike_max + self.strike_tolerance
        {
            return Err(out(format!(
                "strike outside observed range [{}, {}]",
                self.strike_min, self.strike_max
            )));
        }
        Ok(())
    }
}

/// Regular resampling of a surface for renderers. `vols[i][j]` is at
/// `(strikes[j], maturities[i])`; NaN where the surface is undefined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceGrid {
    pub strikes: Vec<f64>,
    pub maturities: Vec<f64>,
    pub vols: Vec<Vec<f64>>,
}

#[derive(Debug)]
enum SurfaceBacking {
    Svi(SviSurface),
    Interpolated(Box<dyn SurfaceInterpolator>),
}

#[derive(Debug)]
pub struct VolatilitySurface {
    surface_type: SurfaceType,
    fit_method: FitMethod,
    backing: SurfaceBacking,
    forwards: ForwardCurve,
    points: Vec<ImpliedVolPoint>,
    svi_fits: Vec<SliceFit>,
    domain: SurfaceDomain,
    diagnostics: SurfaceDiagnostics,
}

impl VolatilitySurface {
    /// Filter the chain, solve implied vols and fit with the configured method.
    pub fn build(
        quotes: &[Quote],
        market: &dyn MarketInputs,
        config: &SurfaceConfig,
    ) -> Result<Self> {
        config.validate()?;
        validate_positive(market.spot(), "spot")?;

        let (slices, filter) = ChainFilter::from_config(config).apply(quotes);
        let slices_attempted = slices.len();
        if slices.is_empty() {
            warn!(quotes = quotes.len(), "no maturity slice survived filtering");
            return Err(SurfaceError::EmptySurface { slices_attempted: 0 });
        }
        let eligible: Vec<Quote> = slices.into_iter().flat_map(|s| s.quotes).collect();

        let batch = solve_chain(&eligible, market, config);
        if batch.is_empty() {
            warn!(
                failures = batch.failures.len(),
                "every quote failed the implied vol solve"
            );
            return Err(SurfaceError::EmptySurface { slices_attempted });
        }

        let maturities: Vec<f64> = group_points(&batch.points)
            .iter()
            .map(|s| s.maturity)
            .collect();
        let forwards = ForwardCurve::from_market(market, &maturities)?;
        let diagnostics = SurfaceDiagnostics {
            filter,
            quote_failures: batch.failures,
            ..SurfaceDiagnostics::default()
        };
        Self::fit(batch.points, forwards, config, diagnostics)
    }

    /// Fit a surface to implied vols the caller already holds.
    pub fn from_points(
        points: &[ImpliedVolPoint],
        spot: f64,
        config: &SurfaceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut usable = Vec::with_capacity(points.len());
        for p in points {
            if p.strike > 0.0
                && p.maturity > 0.0
                && p.forward > 0.0
                && p.implied_vol.is_finite()
                && p.implied_vol > 0.0
            {
                usable.push(*p);
            } else {
                debug!(strike = p.strike, maturity = p.maturity, "dropping unusable point");
            }
        }
        if usable.is_empty() {
            return Err(SurfaceError::EmptySurface { slices_attempted: 0 });
        }
        let forwards = ForwardCurve::new(
            spot,
            group_points(&usable)
                .iter()
                .map(|s| (s.maturity, s.forward))
                .collect(),
        )?;
        Self::fit(usable, forwards, config, SurfaceDiagnostics::default())
    }

    fn fit(
        points: Vec<ImpliedVolPoint>,
        forwards: ForwardCurve,
        config: &SurfaceConfig,
        mut diagnostics: SurfaceDiagnostics,
    ) -> Result<Self> {
        let fit_method = config.fit_method();
        if config.surfacetype.is_interactive() {
            debug!(surface_type = ?config.surfacetype, "interactive surface uses the static fit");
        }

        let (backing, points, svi_fits) = match fit_method {
            FitMethod::Svi => {
                let slices = group_points(&points);
                let (surface, fits, kept) = fit_svi(&slices, config, &mut diagnostics)?;
                (SurfaceBacking::Svi(surface), kept, fits)
            }
            FitMethod::Mesh => {
                let order = config.smoothing.then_some(config.order);
                let mesh = MeshSurface::new(&points, order)?;
                (SurfaceBacking::Interpolated(Box::new(mesh)), points, Vec::new())
            }
            FitMethod::Spline => {
                let rbf = RbfSurface::new(&points, config.rbffunc, config.rbf_epsilon)?;
                (SurfaceBacking::Interpolated(Box::new(rbf)), points, Vec::new())
            }
            FitMethod::Trisurf => {
                let tri = TriSurface::new(&points)?;
                (SurfaceBacking::Interpolated(Box::new(tri)), points, Vec::new())
            }
        };

        let domain = SurfaceDomain::from_points(&points, config);
        debug!(
            method = ?fit_method,
            points = points.len(),
            warnings = diagnostics.warnings.len(),
            quote_failures = diagnostics.quote_failures.len(),
            slice_failures = diagnostics.slice_failures.len(),
            "volatility surface built"
        );
        Ok(Self {
            surface_type: config.surfacetype,
            fit_method,
            backing,
            forwards,
            points,
            svi_fits,
            domain,
            diagnostics,
        })
    }

    /// Implied volatility at `(strike, maturity)`.
    pub fn query(&self, strike: f64, maturity: f64) -> Result<f64> {
        if !strike.is_finite() || strike <= 0.0 {
            return Err(SurfaceError::invalid(format!(
                "strike must be positive and finite, got {strike}"
            )));
        }
        check_maturity(maturity)?;
        self.domain.check(strike, maturity)?;

        let vol = match &self.backing {
            SurfaceBacking::Svi(svi) => {
                let k = (strike / self.forwards.forward(maturity)).ln();
                svi.implied_vol(k, maturity)
            }
            SurfaceBacking::Interpolated(interp) => interp.implied_vol(strike, maturity),
        };
        if !vol.is_finite() || vol < 0.0 {
            return Err(SurfaceError::OutOfDomain {
                strike,
                maturity,
                reason: format!("surface undefined here (value {vol})"),
            });
        }
        Ok(vol)
    }

    /// Implied volatility with the strike given as a percentage of spot (ATM = 100).
    pub fn vol(&self, maturity: f64, strike_pct: f64) -> Result<f64> {
        if !strike_pct.is_finite() || strike_pct <= 0.0 {
            return Err(SurfaceError::invalid(format!(
                "strike percentage must be positive, got {strike_pct}"
            )));
        }
        self.query(self.forwards.spot() * strike_pct / 100.0, maturity)
    }

    /// Rows follow `maturities`, columns follow `strikes`.
    pub fn grid(&self, strikes: &[f64], maturities: &[f64]) -> Vec<Vec<f64>> {
        let row = |t: &f64| -> Vec<f64> {
            strikes
                .iter()
                .map(|&k| self.query(k, *t).unwrap_or(f64::NAN))
                .collect()
        };

        #[cfg(feature = "parallel")]
        let rows = maturities.par_iter().map(row).collect();
        #[cfg(not(feature = "parallel"))]
        let rows = maturities.iter().map(row).collect();
        rows
    }

    /// Resample over the fitted domain at `spacegrain` points per axis.
    pub fn sample_grid(&self, spacegrain: usize) -> SurfaceGrid {
        let d = &self.domain;
        let strikes = linspace(d.strike_min, d.strike_max, spacegrain);
        let maturities = linspace(d.maturity_min, d.maturity_max, spacegrain);
        let vols = self.grid(&strikes, &maturities);
        SurfaceGrid {
            strikes,
            maturities,
            vols,
        }
    }

    pub fn surface_type(&self) -> SurfaceType {
        self.surface_type
    }

    pub fn fit_method(&self) -> FitMethod {
        self.fit_method
    }

    /// Implied vol points the surface was fitted to.
    pub fn points(&self) -> &[ImpliedVolPoint] {
        &self.points
    }

    /// Per-slice SVI calibrations; empty for the non-parametric methods.
    pub fn svi_fits(&self) -> &[SliceFit] {
        &self.svi_fits
    }

    pub fn svi_surface(&self) -> Option<&SviSurface> {
        match &self.backing {
            SurfaceBacking::Svi(s) => Some(s),
            SurfaceBacking::Interpolated(_) => None,
        }
    }

    pub fn diagnostics(&self) -> &SurfaceDiagnostics {
        &self.diagnostics
    }

    pub fn domain(&self) -> &SurfaceDomain {
        &self.domain
    }

    pub fn spot(&self) -> f64 {
        self.forwards.spot()
    }

    pub fn forward_curve(&self) -> &ForwardCurve {
        &self.forwards
    }

    /// Distinct maturities of the fitted points, ascending.
    pub fn maturities(&self) -> Vec<f64> {
        group_points(&self.points).iter().map(|s| s.maturity).collect()
    }

    pub fn strike_range(&self) -> (f64, f64) {
        (self.domain.strike_min, self.domain.strike_max)
    }
}

/// Calibrate every slice, keep the ones that fit and scan the result for
/// calendar arbitrage. Returns the surface, its fits and the points of the
/// slices that survived.
fn fit_svi(
    slices: &[VolSlice],
    config: &SurfaceConfig,
    diagnostics: &mut SurfaceDiagnostics,
) -> Result<(SviSurface, Vec<SliceFit>, Vec<ImpliedVolPoint>)> {
    let mut fits = Vec::new();
    let mut kept = Vec::new();
    for (slice, result) in slices.iter().zip(calibrate_slices(slices, &config.svi)) {
        match result {
            Ok(fit) => {
                diagnostics.warnings.extend(fit.warning());
                kept.extend_from_slice(&slice.points);
                fits.push(fit);
            }
            Err(error) => {
                warn!(maturity = slice.maturity, %error, "SVI slice dropped");
                diagnostics.slice_failures.push(SliceFailure {
                    maturity: slice.maturity,
                    points: slice.points.len(),
                    reason: error.to_string(),
                    error,
                });
            }
        }
    }
    if fits.is_empty() {
        return Err(SurfaceError::EmptySurface {
            slices_attempted: slices.len(),
        });
    }

    let surface = SviSurface::new(
        fits.iter().map(|f| f.slice).collect(),
        config.calendar_tolerance,
    )?;
    let (k_min, k_max) = min_max(kept.iter().map(|p| p.log_moneyness));
    diagnostics
        .warnings
        .extend(surface.calendar_warnings(&linspace(k_min, k_max, CALENDAR_GRID_POINTS)));
    Ok((surface, fits, kept))
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}
