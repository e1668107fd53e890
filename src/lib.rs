//! # volvis-surface: implied volatility surfaces from option chains
//!
//! `volvis-surface` turns a cleaned option chain into a queryable implied volatility
//! surface. Each quote is inverted through Black-76 to an implied vol, and the resulting
//! point cloud is fitted either with per-maturity SVI slices or with one of three
//! non-parametric interpolators.
//!
//! ## Core Features
//!
//! - **Implied vol solver**: safeguarded Newton-Raphson, bisection or Brent, with
//!   no-arbitrage bounds checked up front
//! - **SVI calibration**: CMA-ES global search and L-BFGS-B refinement per slice,
//!   calendar arbitrage reported across slices
//! - **Interpolators**: Delaunay triangulation, cubic spline mesh and radial basis
//!   functions
//! - **Partial results**: failing quotes and slices are recorded, not fatal
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use volvis_surface::{build_surface, FlatMarket, Quote, SurfaceConfig, SurfaceType, SkewReport};
//!
//! # fn load_chain() -> Vec<Quote> { vec![] }
//! let quotes: Vec<Quote> = load_chain();
//! let market = FlatMarket::new(4500.0, 0.05, 0.015);
//! let config = SurfaceConfig::default().with_surface_type(SurfaceType::Svi);
//!
//! let surface = build_surface(&quotes, &market, &config)?;
//! let atm_6m = surface.vol(0.5, 100.0)?;
//! println!("6m ATM vol: {:.2}%", atm_6m * 100.0);
//! println!("{}", SkewReport::from_config(&surface, &config.skew));
//! # Ok::<(), volvis_surface::SurfaceError>(())
//! ```
//!
//! ## Configuration Presets
//!
//! SVI optimiser presets live in [`default_configs`]:
//! - `production()`: CMA-ES plus L-BFGS-B, tight tolerance
//! - `fast()`: L-BFGS-B only, for development
//! - `research()`: large CMA-ES budget and adaptive bounds
//! - `minimal()`: quick validation settings

// ================================================================================================
// MODULES
// ================================================================================================

pub mod calibration;
pub mod chain;
pub mod error;
pub mod models;
pub mod skew;
pub mod surface;

// ================================================================================================
// IMPORTS
// ================================================================================================

use calibration::types::{group_points, ModelCalibrator};
use models::svi::svi_calibrator::{calibrate_slice, SviSliceCalibrator};

// ================================================================================================
// PUBLIC RE-EXPORTS
// ================================================================================================

pub use calibration::{
    config::{
        FilterConfig, FitMethod, ImpliedVolConfig, IvMethod, SurfaceConfig, SurfaceType, SviConfig,
    },
    types::{
        FlatMarket, ForwardCurve, ImpliedVolPoint, MarketInputs, OptionType, Quote, VolSlice,
        VolType,
    },
};
pub use chain::{ChainFilter, MaturitySlice};
pub use error::{Result, SurfaceError, SurfaceWarning};
pub use models::bs::{Black76, PricingModel};
pub use models::implied::{solve_chain, ImpliedVolBatch, ImpliedVolSolver, QuoteFailure};
pub use models::interp::RbfKernel;
pub use models::svi::{
    svi_calibrator::{CalibrationStatus, SVIParamBounds, SliceFit},
    svi_model::{SVIParams, SVISlice, SviSurface},
};
pub use skew::{SkewDirection, SkewReport};
pub use surface::{SurfaceDiagnostics, SurfaceGrid, VolatilitySurface};

// ================================================================================================
// DEFAULT CONFIGURATIONS
// ================================================================================================

/// SVI optimiser presets.
///
/// Each returns an [`SviConfig`]; plug it into [`SurfaceConfig::svi`] to use it for a
/// whole surface build.
pub mod default_configs {
    use crate::calibration::config::SviConfig;

    /// CMA-ES global search followed by L-BFGS-B (1,000 iterations, tol 1e-10).
    ///
    /// # Example
    ///
    /// ```rust
    /// use volvis_surface::{default_configs, SurfaceConfig};
    ///
    /// let config = SurfaceConfig {
    ///     svi: default_configs::production(),
    ///     ..SurfaceConfig::default()
    /// };
    /// assert!(config.svi.global_search);
    /// ```
    pub fn production() -> SviConfig {
        SviConfig::production()
    }

    /// L-BFGS-B only, 300 iterations, tol 1e-8.
    pub fn fast() -> SviConfig {
        SviConfig::fast()
    }

    /// Large CMA-ES budget with adaptive bound expansion.
    pub fn research() -> SviConfig {
        SviConfig::research()
    }

    /// 50 iterations, tol 1e-6.
    pub fn minimal() -> SviConfig {
        SviConfig::minimal()
    }
}

// ================================================================================================
// CONVENIENCE FUNCTIONS
// ================================================================================================

/// Build a surface from raw quotes. Same as [`VolatilitySurface::build`].
pub fn build_surface(
    quotes: &[Quote],
    market: &dyn MarketInputs,
    config: &SurfaceConfig,
) -> Result<VolatilitySurface> {
    VolatilitySurface::build(quotes, market, config)
}

/// Calibrate SVI parameters to implied vols of a single expiration.
///
/// # Errors
///
/// * [`SurfaceError::InvalidInput`] if the points span more than one maturity
/// * [`SurfaceError::InsufficientData`] with fewer than three points
pub fn calibrate_svi(points: &[ImpliedVolPoint], config: &SviConfig) -> Result<SliceFit> {
    let slice = single_slice(points)?;
    calibrate_slice(&slice, config)
}

/// Evaluate the SVI calibration objective for a fixed parameter set.
///
/// This is exactly the loss [`calibrate_svi`] minimises, so callers can measure the fit
/// quality of existing parameters without re-running the optimiser.
pub fn evaluate_svi(
    points: &[ImpliedVolPoint],
    params: &SVIParams,
    config: &SviConfig,
) -> Result<f64> {
    let slice = single_slice(points)?;
    let calibrator = SviSliceCalibrator::new(&slice, &config.bounds, config.penalty_weight)?;
    Ok(calibrator.evaluate_objective(&params.to_vec()))
}

fn single_slice(points: &[ImpliedVolPoint]) -> Result<VolSlice> {
    let mut slices = group_points(points);
    match slices.len() {
        0 => Err(SurfaceError::InsufficientData {
            required: models::svi::svi_calibrator::MIN_SVI_POINTS,
            found: 0,
            context: "SVI slice".into(),
        }),
        1 => Ok(slices.remove(0)),
        n => Err(SurfaceError::InvalidInput {
            message: format!("SVI calibration needs a single expiration, got {n}"),
        }),
    }
}
