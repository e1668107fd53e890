use serde::{Deserialize, Serialize};
use std::any::Any;

use crate::error::{validate_positive, Result, SurfaceError};

/// Maturities closer than this (in years) belong to the same slice.
pub const MATURITY_EPSILON: f64 = 1e-8;

/// Contract type of a vanilla option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

/// Which observed price feeds the implied volatility solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolType {
    Bid,
    Mid,
    Ask,
    #[default]
    Last,
}

/// One row of the cleaned option chain.
///
/// Quotes are immutable once extracted from the chain; every derived quantity
/// (implied vol, log-moneyness) lives in separate types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Strike price
    pub strike: f64,
    /// Time to expiration in years
    pub maturity: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub option_type: OptionType,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub open_interest: Option<f64>,
    /// Whether the expiry is a standard monthly (third Friday) expiry, as flagged by
    /// the calendar layer.
    #[serde(default = "default_standard_expiry")]
    pub standard_expiry: bool,
}

fn default_standard_expiry() -> bool {
    true
}

impl Quote {
    /// Quote with a single traded price used for every [`VolType`].
    pub fn with_price(option_type: OptionType, strike: f64, maturity: f64, price: f64) -> Self {
        Self {
            strike,
            maturity,
            bid: Some(price),
            ask: Some(price),
            last: Some(price),
            option_type,
            volume: None,
            open_interest: None,
            standard_expiry: true,
        }
    }

    /// Observed price for the requested price type. Mid requires both sides.
    pub fn price(&self, voltype: VolType) -> Option<f64> {
        match voltype {
            VolType::Bid => self.bid,
            VolType::Ask => self.ask,
            VolType::Last => self.last,
            VolType::Mid => match (self.bid, self.ask) {
                (Some(b), Some(a)) => Some(0.5 * (b + a)),
                _ => None,
            },
        }
    }
}

/// Per-maturity forward and discounting supplied by the rates/dividends layer.
pub trait MarketInputs: Send + Sync {
    /// Underlying reference level.
    fn spot(&self) -> f64;
    /// Forward price for delivery at `t` (years).
    fn forward(&self, t: f64) -> f64;
    /// Discount factor to `t` (years).
    fn discount_factor(&self, t: f64) -> f64;
}

/// Flat continuously-compounded rate and dividend yield.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlatMarket {
    pub spot: f64,
    pub r: f64,
    pub q: f64,
}

impl FlatMarket {
    pub fn new(spot: f64, r: f64, q: f64) -> Self {
        Self { spot, r, q }
    }
}

impl Default for FlatMarket {
    fn default() -> Self {
        Self {
            spot: 100.0,
            r: 0.005,
            q: 0.0,
        }
    }
}

impl MarketInputs for FlatMarket {
    fn spot(&self) -> f64 {
        self.spot
    }

    fn forward(&self, t: f64) -> f64 {
        self.spot * ((self.r - self.q) * t).exp()
    }

    fn discount_factor(&self, t: f64) -> f64 {
        (-self.r * t).exp()
    }
}

/// Forward curve sampled at slice maturities.
///
/// `ln(F/S)` is interpolated linearly in maturity through the origin, so a flat
/// rate market is reproduced exactly. Past the last node the last segment's drift
/// is extended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardCurve {
    spot: f64,
    nodes: Vec<(f64, f64)>,
}

impl ForwardCurve {
    pub fn new(spot: f64, mut forwards: Vec<(f64, f64)>) -> Result<Self> {
        validate_positive(spot, "spot")?;
        for &(t, f) in &forwards {
            validate_positive(t, "forward maturity")?;
            validate_positive(f, "forward")?;
        }
        forwards.sort_by(|a, b| a.0.total_cmp(&b.0));
        forwards.dedup_by(|a, b| (a.0 - b.0).abs() < MATURITY_EPSILON);

        let mut nodes = Vec::with_capacity(forwards.len() + 1);
        nodes.push((0.0, 0.0));
        nodes.extend(forwards.into_iter().map(|(t, f)| (t, (f / spot).ln())));
        Ok(Self { spot, nodes })
    }

    /// Sample a [`MarketInputs`] implementation at the given maturities.
    pub fn from_market(market: &dyn MarketInputs, maturities: &[f64]) -> Result<Self> {
        let forwards = maturities
            .iter()
            .map(|&t| (t, market.forward(t)))
            .collect();
        Self::new(market.spot(), forwards)
    }

    pub fn spot(&self) -> f64 {
        self.spot
    }

    pub fn forward(&self, t: f64) -> f64 {
        let n = self.nodes.len();
        if n == 1 {
            return self.spot;
        }
        let idx = self.nodes.partition_point(|(nt, _)| *nt < t).clamp(1, n - 1);
        let (t0, y0) = self.nodes[idx - 1];
        let (t1, y1) = self.nodes[idx];
        let y = y0 + (y1 - y0) * (t - t0) / (t1 - t0);
        self.spot * y.exp()
    }
}

/// Implied volatility recovered for one quote.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImpliedVolPoint {
    pub strike: f64,
    /// Time to expiration in years
    pub maturity: f64,
    pub forward: f64,
    /// ln(strike / forward)
    pub log_moneyness: f64,
    /// Annualised implied volatility (decimal)
    pub implied_vol: f64,
    pub option_type: OptionType,
}

impl ImpliedVolPoint {
    pub fn new(
        strike: f64,
        maturity: f64,
        forward: f64,
        implied_vol: f64,
        option_type: OptionType,
    ) -> Self {
        Self {
            strike,
            maturity,
            forward,
            log_moneyness: (strike / forward).ln(),
            implied_vol,
            option_type,
        }
    }

    pub fn total_variance(&self) -> f64 {
        self.implied_vol * self.implied_vol * self.maturity
    }
}

/// Solved points sharing one maturity, sorted by strike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolSlice {
    pub maturity: f64,
    pub forward: f64,
    pub points: Vec<ImpliedVolPoint>,
}

impl VolSlice {
    pub fn log_moneyness(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.log_moneyness).collect()
    }

    pub fn total_variances(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total_variance()).collect()
    }
}

/// Group points by maturity (within [`MATURITY_EPSILON`]), each slice sorted by strike,
/// slices sorted by maturity.
pub fn group_points(points: &[ImpliedVolPoint]) -> Vec<VolSlice> {
    let mut sorted: Vec<ImpliedVolPoint> = points.to_vec();
    sorted.sort_by(|a, b| {
        a.maturity
            .total_cmp(&b.maturity)
            .then(a.strike.total_cmp(&b.strike))
    });

    let mut slices: Vec<VolSlice> = Vec::new();
    for p in sorted {
        match slices.last_mut() {
            Some(s) if (p.maturity - s.maturity).abs() < MATURITY_EPSILON => s.points.push(p),
            _ => slices.push(VolSlice {
                maturity: p.maturity,
                forward: p.forward,
                points: vec![p],
            }),
        }
    }
    slices
}

/// Average points sharing the same (strike, maturity), e.g. a call and a put at one
/// strike. Interpolators need distinct nodes.
pub fn dedup_points(points: &[ImpliedVolPoint]) -> Vec<ImpliedVolPoint> {
    let mut out: Vec<ImpliedVolPoint> = Vec::new();
    for slice in group_points(points) {
        let mut i = 0;
        while i < slice.points.len() {
            let first = slice.points[i];
            let mut j = i + 1;
            let mut vol_sum = first.implied_vol;
            while j < slice.points.len() && (slice.points[j].strike - first.strike).abs() < 1e-9 {
                vol_sum += slice.points[j].implied_vol;
                j += 1;
            }
            let mut merged = first;
            merged.implied_vol = vol_sum / (j - i) as f64;
            out.push(merged);
            i = j;
        }
    }
    out
}

/// Model calibrator trait for bounded parameter optimisation
pub trait ModelCalibrator: Send + Sync {
    /// Returns the name of the model (e.g., "svi")
    fn model_name(&self) -> &str;

    /// How many parameters are in the model's optimization vector
    fn param_count(&self) -> usize;

    /// Returns the vector of (min, max) bounds for each parameter
    fn param_bounds(&self) -> &[(f64, f64)];

    /// Objective value for parameter vector `x` against the calibrator's own data
    fn evaluate_objective(&self, x: &[f64]) -> f64;

    /// Returns parameter names in the order they appear in the optimization vector
    fn param_names(&self) -> Vec<&str>;

    /// Expand internal parameter bounds if parameters are near current bounds.
    /// Returns true if any bound was adjusted.
    fn expand_bounds_if_needed(
        &mut self,
        _params: &[f64],
        _proximity_threshold: f64,
        _expansion_factor: f64,
    ) -> bool {
        false
    }

    /// Support for downcasting
    fn as_any(&self) -> &dyn Any;
}

pub(crate) fn check_maturity(t: f64) -> Result<f64> {
    if !t.is_finite() || t <= 0.0 {
        return Err(SurfaceError::invalid(format!(
            "maturity must be positive and finite, got {t}"
        )));
    }
    Ok(t)
}
