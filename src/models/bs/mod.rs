// Black-76 pricing on forward and discount factor. This is the formula family the
// implied volatility solver inverts; spot/rate/dividend inputs are folded into the
// forward by the caller.

use crate::calibration::types::OptionType;

fn norm_cdf(x: f64) -> f64 {
    // 0.5 * [1 + erf(x / sqrt(2))]
    0.5 * (1.0 + libm::erf(x / std::f64::consts::SQRT_2))
}

fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Pricing formula that can be inverted for volatility.
pub trait PricingModel: Send + Sync {
    /// Undiscounted-forward price of a European option, discounted by `df`.
    fn price(
        &self,
        option_type: OptionType,
        forward: f64,
        strike: f64,
        t: f64,
        df: f64,
        sigma: f64,
    ) -> f64;

    /// Sensitivity of [`PricingModel::price`] to `sigma`.
    fn vega(&self, forward: f64, strike: f64, t: f64, df: f64, sigma: f64) -> f64;

    /// Open interval of attainable prices as `sigma` ranges over (0, inf).
    fn price_bounds(
        &self,
        option_type: OptionType,
        forward: f64,
        strike: f64,
        df: f64,
    ) -> (f64, f64);
}

/// Black (1976) model for options on a forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct Black76;

impl Black76 {
    fn d1_d2(forward: f64, strike: f64, t: f64, sigma: f64) -> (f64, f64) {
        let sd = sigma * t.sqrt();
        let d1 = ((forward / strike).ln() + 0.5 * sd * sd) / sd;
        (d1, d1 - sd)
    }
}

impl PricingModel for Black76 {
    fn price(
        &self,
        option_type: OptionType,
        forward: f64,
        strike: f64,
        t: f64,
        df: f64,
        sigma: f64,
    ) -> f64 {
        if t <= 0.0 || sigma <= 0.0 {
            let intrinsic = match option_type {
                OptionType::Call => forward - strike,
                OptionType::Put => strike - forward,
            };
            return df * intrinsic.max(0.0);
        }
        let (d1, d2) = Self::d1_d2(forward, strike, t, sigma);
        match option_type {
            OptionType::Call => df * (forward * norm_cdf(d1) - strike * norm_cdf(d2)),
            OptionType::Put => df * (strike * norm_cdf(-d2) - forward * norm_cdf(-d1)),
        }
    }

    fn vega(&self, forward: f64, strike: f64, t: f64, df: f64, sigma: f64) -> f64 {
        if t <= 0.0 || sigma <= 0.0 {
            return 0.0;
        }
        let (d1, _) = Self::d1_d2(forward, strike, t, sigma);
        df * forward * norm_pdf(d1) * t.sqrt()
    }

    fn price_bounds(
        &self,
        option_type: OptionType,
        forward: f64,
        strike: f64,
        df: f64,
    ) -> (f64, f64) {
        match option_type {
            OptionType::Call => (df * (forward - strike).max(0.0), df * forward),
            OptionType::Put => (df * (strike - forward).max(0.0), df * strike),
        }
    }
}

/// Black-Scholes price from spot, continuously-compounded rate and dividend yield.
pub fn black_scholes_price(
    option_type: OptionType,
    spot: f64,
    strike: f64,
    r: f64,
    q: f64,
    t: f64,
    sigma: f64,
) -> f64 {
    let forward = spot * ((r - q) * t).exp();
    Black76.price(option_type, forward, strike, t, (-r * t).exp(), sigma)
}
