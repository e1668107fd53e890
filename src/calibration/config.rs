use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurfaceError};
use crate::models::interp::rbf::RbfKernel;
use crate::models::svi::svi_calibrator::SVIParamBounds;
use crate::skew::SkewDirection;

pub use crate::calibration::types::VolType;

/// Surface representation requested by the caller.
///
/// The `interactive_*` variants only change how a renderer draws the result; they fit
/// exactly like their static counterparts (see [`SurfaceType::fit_method`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceType {
    Trisurf,
    #[default]
    Mesh,
    Spline,
    Svi,
    InteractiveMesh,
    InteractiveSpline,
    InteractiveSvi,
}

/// Fitting path behind a [`SurfaceType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    Trisurf,
    Mesh,
    Spline,
    Svi,
}

impl SurfaceType {
    pub fn fit_method(self) -> FitMethod {
        match self {
            SurfaceType::Trisurf => FitMethod::Trisurf,
            SurfaceType::Mesh | SurfaceType::InteractiveMesh => FitMethod::Mesh,
            SurfaceType::Spline | SurfaceType::InteractiveSpline => FitMethod::Spline,
            SurfaceType::Svi | SurfaceType::InteractiveSvi => FitMethod::Svi,
        }
    }

    pub fn is_interactive(self) -> bool {
        matches!(
            self,
            SurfaceType::InteractiveMesh
                | SurfaceType::InteractiveSpline
                | SurfaceType::InteractiveSvi
        )
    }
}

/// Root-finding scheme for implied volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvMethod {
    /// Newton-Raphson on vega, safeguarded by a bisection bracket
    #[default]
    #[serde(alias = "nr")]
    NewtonRaphson,
    Bisection,
    /// Brent's method via the `roots` crate
    Brent,
    /// Coarse-to-fine grid scan of the vol bracket, no derivatives
    Naive,
}

/// Implied volatility solver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpliedVolConfig {
    pub method: IvMethod,
    /// Absolute price difference accepted as converged
    pub tolerance: f64,
    pub min_vol: f64,
    pub max_vol: f64,
    pub max_iter: usize,
}

impl Default for ImpliedVolConfig {
    fn default() -> Self {
        Self {
            method: IvMethod::NewtonRaphson,
            tolerance: 1e-8,
            min_vol: 1e-6,
            max_vol: 5.0,
            max_iter: 100,
        }
    }
}

/// Chain thresholds. Most are applied by the acquisition layer; the core re-applies
/// them so only eligible quotes and slices reach the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum quotes per maturity for the slice to be fitted
    pub minopts: usize,
    /// Minimum days to expiry
    pub mindays: f64,
    /// Minimum traded volume (quotes without a volume pass)
    pub volume: f64,
    /// Minimum open interest (quotes without open interest pass)
    pub openint: f64,
    /// Keep only standard monthly expiries
    pub monthlies: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            minopts: 3,
            mindays: 0.0,
            volume: 0.0,
            openint: 0.0,
            monthlies: false,
        }
    }
}

/// CMA-ES specific configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmaEsConfig {
    /// Random seed for reproducibility
    pub seed: Option<u64>,
    /// Whether to evaluate the population in parallel
    pub parallel_eval: bool,
    /// Verbosity level (0=silent, 1=minimal, 2=normal)
    pub verbosity: u8,
    /// Number of IPOP restarts (0 = no IPOP)
    pub ipop_restarts: usize,
    /// Factor to increase population size in IPOP restarts
    pub ipop_increase_factor: f64,
    /// Number of BIPOP restarts (0 = no BIPOP)
    pub bipop_restarts: usize,
    /// Total function evaluations budget
    pub total_evals_budget: usize,
    /// Whether to use advanced sub-run budgeting logic
    pub use_subrun_budgeting: bool,
    /// Population size
    pub pop_size: usize,
    /// Maximum generations
    pub max_gen: usize,
}

impl Default for CmaEsConfig {
    fn default() -> Self {
        Self {
            seed: Some(123456),
            parallel_eval: false,
            verbosity: 0,
            ipop_restarts: 0,
            ipop_increase_factor: 2.0,
            bipop_restarts: 2,
            total_evals_budget: 20000,
            use_subrun_budgeting: false,
            pop_size: 30,
            max_gen: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBoundsConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    pub proximity_threshold: f64,
    pub expansion_factor: f64,
}

impl Default for AdaptiveBoundsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 3,
            proximity_threshold: 0.1, // 10% from edge
            expansion_factor: 0.25,   // expand by 25%
        }
    }
}

/// SVI calibration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SviConfig {
    /// Derive the starting point from the slice instead of the `*_init` values
    #[serde(default = "default_compute_initial")]
    pub compute_initial: bool,

    #[serde(default = "default_a_init")]
    pub a_init: f64,
    #[serde(default = "default_b_init")]
    pub b_init: f64,
    #[serde(default = "default_rho_init")]
    pub rho_init: f64,
    #[serde(default)]
    pub m_init: f64,
    #[serde(default = "default_sigma_init")]
    pub sigma_init: f64,

    /// L-BFGS-B iteration budget
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Convergence tolerance on the objective
    #[serde(default = "default_tol")]
    pub tol: f64,

    #[serde(default)]
    pub bounds: SVIParamBounds,

    /// Weight of the non-negative total variance penalty
    #[serde(default = "default_penalty_weight")]
    pub penalty_weight: f64,

    /// Run CMA-ES around the starting point before the local refinement
    #[serde(default)]
    pub global_search: bool,

    #[serde(default)]
    pub cmaes: CmaEsConfig,

    #[serde(default)]
    pub adaptive_bounds: AdaptiveBoundsConfig,
}

impl Default for SviConfig {
    fn default() -> Self {
        Self {
            compute_initial: default_compute_initial(),
            a_init: default_a_init(),
            b_init: default_b_init(),
            rho_init: default_rho_init(),
            m_init: 0.0,
            sigma_init: default_sigma_init(),
            max_iter: default_max_iter(),
            tol: default_tol(),
            bounds: SVIParamBounds::default(),
            penalty_weight: default_penalty_weight(),
            global_search: false,
            cmaes: CmaEsConfig::default(),
            adaptive_bounds: AdaptiveBoundsConfig::default(),
        }
    }
}

impl SviConfig {
    /// Production calibration: local refinement seeded by the slice heuristic plus a
    /// CMA-ES safety net.
    pub fn production() -> Self {
        Self {
            max_iter: 1000,
            tol: 1e-10,
            global_search: true,
            cmaes: CmaEsConfig {
                total_evals_budget: 200000,
                bipop_restarts: 5,
                ..CmaEsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Fast configuration for development and testing
    pub fn fast() -> Self {
        Self {
            max_iter: 300,
            tol: 1e-8,
            ..Self::default()
        }
    }

    /// High-precision configuration for research and backtesting
    pub fn research() -> Self {
        Self {
            max_iter: 10000,
            tol: 1e-12,
            global_search: true,
            cmaes: CmaEsConfig {
                pop_size: 100,
                max_gen: 200,
                total_evals_budget: 1000000,
                bipop_restarts: 5,
                ipop_restarts: 3,
                ..CmaEsConfig::default()
            },
            adaptive_bounds: AdaptiveBoundsConfig {
                enabled: true,
                ..AdaptiveBoundsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Minimal configuration for quick validation and debugging
    pub fn minimal() -> Self {
        Self {
            max_iter: 50,
            tol: 1e-6,
            ..Self::default()
        }
    }

    pub fn initial_guess(&self) -> [f64; 5] {
        [
            self.a_init,
            self.b_init,
            self.rho_init,
            self.m_init,
            self.sigma_init,
        ]
    }
}

fn default_compute_initial() -> bool {
    true
}

fn default_a_init() -> f64 {
    0.01
}

fn default_b_init() -> f64 {
    0.1
}

fn default_rho_init() -> f64 {
    -0.3
}

fn default_sigma_init() -> f64 {
    0.1
}

fn default_max_iter() -> usize {
    500
}

fn default_tol() -> f64 {
    1e-10
}

fn default_penalty_weight() -> f64 {
    1e4
}

/// Where queries stop being answered and start failing with `OutOfDomain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Accepted distance (calendar days) beyond the first/last fitted maturity
    pub maturity_tolerance_days: f64,
    /// Accepted distance beyond the observed strike span, as a fraction of that span
    pub strike_tolerance: f64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            maturity_tolerance_days: 7.0,
            strike_tolerance: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkewConfig {
    pub months: usize,
    pub direction: SkewDirection,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            months: 12,
            direction: SkewDirection::Down,
        }
    }
}

/// Complete configuration of one surface build.
///
/// Immutable once constructed; every stage receives it by reference and a new build is
/// required whenever it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub voltype: VolType,
    pub surfacetype: SurfaceType,
    /// Polynomial smoothing of each maturity slice before meshing
    pub smoothing: bool,
    /// Polynomial order used by smoothing
    pub order: usize,
    /// Points per axis of sampled grids
    pub spacegrain: usize,
    pub rbffunc: RbfKernel,
    /// RBF shape parameter; `None` uses the mean node spacing
    pub rbf_epsilon: Option<f64>,
    /// Tolerance applied when flagging calendar arbitrage
    pub calendar_tolerance: f64,
    pub filter: FilterConfig,
    pub implied: ImpliedVolConfig,
    pub svi: SviConfig,
    pub domain: DomainConfig,
    pub skew: SkewConfig,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            voltype: VolType::default(),
            surfacetype: SurfaceType::default(),
            smoothing: false,
            order: 3,
            spacegrain: 100,
            rbffunc: RbfKernel::default(),
            rbf_epsilon: None,
            calendar_tolerance: 1e-10,
            filter: FilterConfig::default(),
            implied: ImpliedVolConfig::default(),
            svi: SviConfig::default(),
            domain: DomainConfig::default(),
            skew: SkewConfig::default(),
        }
    }
}

impl SurfaceConfig {
    pub fn with_surface_type(mut self, surfacetype: SurfaceType) -> Self {
        self.surfacetype = surfacetype;
        self
    }

    pub fn fit_method(&self) -> FitMethod {
        self.surfacetype.fit_method()
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: SurfaceConfig =
            toml::from_str(text).context("failed to parse surface configuration")?;
        config
            .validate()
            .context("surface configuration failed validation")?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.spacegrain < 2 {
            return Err(SurfaceError::invalid(format!(
                "spacegrain must be at least 2, got {}",
                self.spacegrain
            )));
        }
        if self.order == 0 {
            return Err(SurfaceError::invalid("smoothing order must be at least 1"));
        }
        let iv = &self.implied;
        if !(iv.tolerance > 0.0) || !(iv.min_vol > 0.0) || !(iv.max_vol > iv.min_vol) {
            return Err(SurfaceError::invalid(format!(
                "implied vol settings invalid: tolerance={}, bracket=({}, {})",
                iv.tolerance, iv.min_vol, iv.max_vol
            )));
        }
        if iv.max_iter == 0 || self.svi.max_iter == 0 {
            return Err(SurfaceError::invalid("iteration budgets must be positive"));
        }
        if !(self.svi.tol > 0.0) {
            return Err(SurfaceError::invalid(format!(
                "svi tol must be positive, got {}",
                self.svi.tol
            )));
        }
        self.svi.bounds.validate()?;
        if let Some(eps) = self.rbf_epsilon {
            if !(eps > 0.0) {
                return Err(SurfaceError::invalid(format!(
                    "rbf_epsilon must be positive, got {eps}"
                )));
            }
        }
        Ok(())
    }
}
