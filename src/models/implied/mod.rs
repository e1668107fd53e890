//! Implied volatility extraction.
//!
//! Each quote is inverted independently against a [`PricingModel`] (Black-76 by
//! default) using the forward and discount factor supplied by [`MarketInputs`].
//! Quotes that cannot be inverted are reported as [`QuoteFailure`]s; they never abort
//! the rest of the chain.

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use roots::{find_root_brent, SimpleConvergency};
use serde::Serialize;
use tracing::debug;

use crate::calibration::config::{ImpliedVolConfig, IvMethod, SurfaceConfig};
use crate::calibration::types::{
    check_maturity, ImpliedVolPoint, MarketInputs, OptionType, Quote, VolType,
};
use crate::error::{validate_positive, Result, SurfaceError};
use crate::models::bs::{Black76, PricingModel};

/// Cells per pass of the naive grid scan.
const NAIVE_STEPS: usize = 10;

/// Inverts option prices for volatility.
#[derive(Debug, Clone)]
pub struct ImpliedVolSolver<M: PricingModel = Black76> {
    model: M,
    config: ImpliedVolConfig,
    voltype: VolType,
}

impl ImpliedVolSolver<Black76> {
    pub fn new(config: ImpliedVolConfig) -> Self {
        Self::with_model(Black76, config)
    }

    pub fn from_config(config: &SurfaceConfig) -> Self {
        Self::new(config.implied.clone()).with_voltype(config.voltype)
    }
}

impl Default for ImpliedVolSolver<Black76> {
    fn default() -> Self {
        Self::new(ImpliedVolConfig::default())
    }
}

impl<M: PricingModel> ImpliedVolSolver<M> {
    pub fn with_model(model: M, config: ImpliedVolConfig) -> Self {
        Self {
            model,
            config,
            voltype: VolType::default(),
        }
    }

    /// Select which quoted price is inverted.
    pub fn with_voltype(mut self, voltype: VolType) -> Self {
        self.voltype = voltype;
        self
    }

    pub fn config(&self) -> &ImpliedVolConfig {
        &self.config
    }

    /// Implied volatility of `quote` given its forward and discount factor.
    pub fn solve(&self, quote: &Quote, forward: f64, discount: f64) -> Result<f64> {
        let price = quote.price(self.voltype).ok_or_else(|| {
            SurfaceError::invalid(format!(
                "quote K={} T={} has no {:?} price",
                quote.strike, quote.maturity, self.voltype
            ))
        })?;
        self.solve_price(
            quote.option_type,
            price,
            forward,
            quote.strike,
            quote.maturity,
            discount,
        )
    }

    /// Implied volatility from a raw price.
    pub fn solve_price(
        &self,
        option_type: OptionType,
        price: f64,
        forward: f64,
        strike: f64,
        t: f64,
        df: f64,
    ) -> Result<f64> {
        validate_positive(strike, "strike")?;
        validate_positive(forward, "forward")?;
        validate_positive(df, "discount factor")?;
        check_maturity(t)?;
        if !price.is_finite() {
            return Err(SurfaceError::invalid(format!("price must be finite, got {price}")));
        }

        let (lower, upper) = self.model.price_bounds(option_type, forward, strike, df);
        if price <= lower || price >= upper {
            return Err(SurfaceError::NoSolution {
                price,
                lower,
                upper,
            });
        }

        let cfg = &self.config;
        let objective = |sigma: f64| {
            self.model.price(option_type, forward, strike, t, df, sigma) - price
        };

        // The band above is for sigma in (0, inf); the solver only searches the
        // configured vol bracket.
        let f_lo = objective(cfg.min_vol);
        let f_hi = objective(cfg.max_vol);
        if f_lo.abs() <= cfg.tolerance {
            return Ok(cfg.min_vol);
        }
        if f_hi.abs() <= cfg.tolerance {
            return Ok(cfg.max_vol);
        }
        if f_lo > 0.0 || f_hi < 0.0 {
            return Err(SurfaceError::NoSolution {
                price,
                lower: f_lo + price,
                upper: f_hi + price,
            });
        }

        match cfg.method {
            IvMethod::NewtonRaphson => {
                let guess =
                    initial_guess(price, forward, t, df).clamp(cfg.min_vol, cfg.max_vol);
                self.bracketed(guess, forward, strike, t, df, &objective, true)
            }
            IvMethod::Bisection => {
                let mid = 0.5 * (cfg.min_vol + cfg.max_vol);
                self.bracketed(mid, forward, strike, t, df, &objective, false)
            }
            IvMethod::Brent => {
                let mut convergency = SimpleConvergency {
                    eps: cfg.tolerance,
                    max_iter: cfg.max_iter,
                };
                match find_root_brent(cfg.min_vol, cfg.max_vol, &objective, &mut convergency) {
                    Ok(sigma) if objective(sigma).abs() <= cfg.tolerance => Ok(sigma),
                    // Brent may stop on bracket width; polish to the price tolerance
                    Ok(sigma) => self.bracketed(sigma, forward, strike, t, df, &objective, true),
                    Err(_) => Err(SurfaceError::NonConvergence {
                        iterations: cfg.max_iter,
                        residual: f64::NAN,
                    }),
                }
            }
            IvMethod::Naive => self.grid_scan(&objective),
        }
    }

    /// Each pass splits the bracket into [`NAIVE_STEPS`] cells and keeps the first
    /// one where the model price crosses the quote. `max_iter` bounds the passes.
    fn grid_scan(&self, objective: &dyn Fn(f64) -> f64) -> Result<f64> {
        let cfg = &self.config;
        let (mut lo, mut hi) = (cfg.min_vol, cfg.max_vol);
        let mut residual = f64::INFINITY;

        for _ in 0..cfg.max_iter {
            let step = (hi - lo) / NAIVE_STEPS as f64;
            let mut prev = lo;
            for i in 1..=NAIVE_STEPS {
                let sigma = if i == NAIVE_STEPS {
                    hi
                } else {
                    lo + step * i as f64
                };
                let diff = objective(sigma);
                residual = residual.min(diff.abs());
                if diff.abs() <= cfg.tolerance {
                    return Ok(sigma);
                }
                if diff > 0.0 {
                    lo = prev;
                    hi = sigma;
                    break;
                }
                prev = sigma;
            }
        }

        Err(SurfaceError::NonConvergence {
            iterations: cfg.max_iter,
            residual,
        })
    }

    /// Root search kept inside a shrinking bracket. With `newton` the vega step is
    /// taken whenever it lands inside the bracket, otherwise the bracket is bisected.
    #[allow(clippy::too_many_arguments)]
    fn bracketed(
        &self,
        start: f64,
        forward: f64,
        strike: f64,
        t: f64,
        df: f64,
        objective: &dyn Fn(f64) -> f64,
        newton: bool,
    ) -> Result<f64> {
        let cfg = &self.config;
        let (mut lo, mut hi) = (cfg.min_vol, cfg.max_vol);
        let mut sigma = start;
        let mut diff = f64::NAN;

        for _ in 0..cfg.max_iter {
            diff = objective(sigma);
            if diff.abs() <= cfg.tolerance {
                return Ok(sigma);
            }
            // price is increasing in sigma
            if diff > 0.0 {
                hi = sigma;
            } else {
                lo = sigma;
            }

            let mid = 0.5 * (lo + hi);
            sigma = if newton {
                let vega = self.model.vega(forward, strike, t, df, sigma);
                let step = sigma - diff / vega;
                if vega > 1e-12 && step > lo && step < hi {
                    step
                } else {
                    mid
                }
            } else {
                mid
            };
        }

        Err(SurfaceError::NonConvergence {
            iterations: cfg.max_iter,
            residual: diff.abs(),
        })
    }
}

/// Brenner-Subrahmanyam at-the-money approximation.
fn initial_guess(price: f64, forward: f64, t: f64, df: f64) -> f64 {
    (2.0 * std::f64::consts::PI / t).sqrt() * price / (df * forward)
}

/// A quote the solver rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuoteFailure {
    pub strike: f64,
    pub maturity: f64,
    pub option_type: OptionType,
    #[serde(skip)]
    pub error: SurfaceError,
    pub reason: String,
}

/// Outcome of solving a whole chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImpliedVolBatch {
    pub points: Vec<ImpliedVolPoint>,
    pub failures: Vec<QuoteFailure>,
}

impl ImpliedVolBatch {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

fn solve_one(
    solver: &ImpliedVolSolver,
    market: &dyn MarketInputs,
    quote: &Quote,
) -> std::result::Result<ImpliedVolPoint, QuoteFailure> {
    let forward = market.forward(quote.maturity);
    let df = market.discount_factor(quote.maturity);
    solver
        .solve(quote, forward, df)
        .map(|iv| {
            ImpliedVolPoint::new(quote.strike, quote.maturity, forward, iv, quote.option_type)
        })
        .map_err(|error| {
            debug!(
                strike = quote.strike,
                maturity = quote.maturity,
                %error,
                "implied vol solve failed"
            );
            QuoteFailure {
                strike: quote.strike,
                maturity: quote.maturity,
                option_type: quote.option_type,
                reason: error.to_string(),
                error,
            }
        })
}

/// Solve every quote independently. Points come back in input order.
pub fn solve_chain(
    quotes: &[Quote],
    market: &dyn MarketInputs,
    config: &SurfaceConfig,
) -> ImpliedVolBatch {
    let solver = ImpliedVolSolver::from_config(config);

    #[cfg(feature = "parallel")]
    let results: Vec<std::result::Result<ImpliedVolPoint, QuoteFailure>> = quotes
        .par_iter()
        .map(|q| solve_one(&solver, market, q))
        .collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<std::result::Result<ImpliedVolPoint, QuoteFailure>> = quotes
        .iter()
        .map(|q| solve_one(&solver, market, q))
        .collect();

    let mut batch = ImpliedVolBatch::default();
    for r in results {
        match r {
            Ok(p) => batch.points.push(p),
            Err(f) => batch.failures.push(f),
        }
    }
    debug!(
        solved = batch.points.len(),
        failed = batch.failures.len(),
        "implied vol batch complete"
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::types::FlatMarket;
    use approx::assert_relative_eq;

    fn solver(method: IvMethod) -> ImpliedVolSolver {
        ImpliedVolSolver::new(ImpliedVolConfig {
            method,
            ..ImpliedVolConfig::default()
        })
    }

    #[test]
    fn recovers_vol_with_every_method() {
        let (f, df, t) = (101.0, 0.99, 0.5);
        let methods = [
            IvMethod::NewtonRaphson,
            IvMethod::Bisection,
            IvMethod::Brent,
            IvMethod::Naive,
        ];
        let cases = [
            (80.0, OptionType::Put),
            (100.0, OptionType::Call),
            (130.0, OptionType::Call),
        ];
        for method in methods {
            for &(k, ot) in &cases {
                let price = Black76.price(ot, f, k, t, df, 0.27);
                let iv = solver(method).solve_price(ot, price, f, k, t, df).unwrap();
                assert_relative_eq!(iv, 0.27, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn below_intrinsic_is_no_solution() {
        // call K=90, F=100: intrinsic 10, quoted 9
        let err = solver(IvMethod::NewtonRaphson)
            .solve_price(OptionType::Call, 9.0, 100.0, 90.0, 0.25, 1.0)
            .unwrap_err();
        match err {
            SurfaceError::NoSolution { lower, .. } => assert_relative_eq!(lower, 10.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn above_upper_bound_is_no_solution() {
        let err = solver(IvMethod::Bisection)
            .solve_price(OptionType::Put, 95.0, 100.0, 90.0, 0.25, 1.0)
            .unwrap_err();
        assert!(matches!(err, SurfaceError::NoSolution { .. }));
    }

    #[test]
    fn tiny_budget_reports_nonconvergence() {
        let s = ImpliedVolSolver::new(ImpliedVolConfig {
            method: IvMethod::Bisection,
            max_iter: 2,
            tolerance: 1e-12,
            ..ImpliedVolConfig::default()
        });
        let price = Black76.price(OptionType::Call, 100.0, 100.0, 1.0, 1.0, 0.3);
        let err = s
            .solve_price(OptionType::Call, price, 100.0, 100.0, 1.0, 1.0)
            .unwrap_err();
        assert!(matches!(err, SurfaceError::NonConvergence { iterations: 2, .. }));
    }

    #[test]
    fn naive_scan_reports_nonconvergence_on_small_budget() {
        let s = ImpliedVolSolver::new(ImpliedVolConfig {
            method: IvMethod::Naive,
            max_iter: 2,
            ..ImpliedVolConfig::default()
        });
        let price = Black76.price(OptionType::Call, 100.0, 100.0, 1.0, 1.0, 0.2345);
        let err = s
            .solve_price(OptionType::Call, price, 100.0, 100.0, 1.0, 1.0)
            .unwrap_err();
        match err {
            SurfaceError::NonConvergence {
                iterations,
                residual,
            } => {
                assert_eq!(iterations, 2);
                // two passes narrow the bracket to 0.05 wide
                assert!(residual > 1e-8 && residual < 1.0, "residual {residual}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chain_keeps_good_quotes_when_one_fails() {
        let market = FlatMarket::new(100.0, 0.0, 0.0);
        let good = Black76.price(OptionType::Call, 100.0, 100.0, 0.5, 1.0, 0.2);
        let quotes = vec![
            Quote::with_price(OptionType::Call, 100.0, 0.5, good),
            Quote::with_price(OptionType::Call, 90.0, 0.5, 9.0),
        ];
        let batch = solve_chain(&quotes, &market, &SurfaceConfig::default());
        assert_eq!(batch.points.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].strike, 90.0);
        assert_relative_eq!(batch.points[0].implied_vol, 0.2, epsilon = 1e-6);
    }

    #[test]
    fn missing_price_is_invalid_input() {
        let mut q = Quote::with_price(OptionType::Call, 100.0, 0.5, 5.0);
        q.bid = None;
        let s = ImpliedVolSolver::default().with_voltype(VolType::Mid);
        assert!(matches!(
            s.solve(&q, 100.0, 1.0),
            Err(SurfaceError::InvalidInput { .. })
        ));
    }
}
