pub mod bs;
pub mod implied;
pub mod interp;
pub mod svi;

/// Common traits used by the parametric surface models
pub mod traits {
    use crate::error::Result;

    /// Total variance in log-moneyness and maturity, plus the static arbitrage checks.
    pub trait SurfaceModel {
        type Parameters;

        fn parameters(&self) -> &Self::Parameters;
        fn validate_params(&self) -> Result<()>;
        fn total_variance(&self, k: f64, t: f64) -> Result<f64>;
        fn check_calendar_arbitrage(&self, k: f64, t1: f64, t2: f64) -> Result<()>;
        fn check_butterfly_arbitrage_at_k(&self, k: f64, t: f64) -> Result<()>;
    }
}
