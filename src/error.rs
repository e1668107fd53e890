//! Error and warning types for surface construction.
//!
//! Hard failures are [`SurfaceError`] values. Per-quote and per-slice failures are
//! collected into the surface diagnostics instead of aborting the build; only a build
//! where every slice fails surfaces as [`SurfaceError::EmptySurface`].
//!
//! Non-fatal conditions (calendar arbitrage, approximate calibrations) are reported as
//! [`SurfaceWarning`] values and never block usage of the surface.

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SurfaceError>;

/// Errors raised by the implied volatility solver, the calibrators and surface queries.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum SurfaceError {
    /// Observed price lies outside the no-arbitrage band of the pricing formula.
    #[error("no implied volatility for price {price}: outside no-arbitrage band ({lower}, {upper})")]
    NoSolution { price: f64, lower: f64, upper: f64 },

    /// A root-finder or optimiser exhausted its iteration budget.
    #[error("did not converge after {iterations} iterations (residual {residual:.3e})")]
    NonConvergence { iterations: usize, residual: f64 },

    /// Too few usable points to calibrate or interpolate.
    #[error("insufficient data for {context}: need {required}, found {found}")]
    InsufficientData {
        required: usize,
        found: usize,
        context: String,
    },

    /// Query point lies outside the fitted domain.
    #[error("query (strike={strike}, maturity={maturity}) outside surface domain: {reason}")]
    OutOfDomain {
        strike: f64,
        maturity: f64,
        reason: String,
    },

    /// Every maturity slice failed, so there is nothing to build a surface from.
    #[error("surface construction failed: all {slices_attempted} slices were unusable")]
    EmptySurface { slices_attempted: usize },

    /// Invalid inputs (non-finite numbers, non-positive strikes, bad configuration).
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

impl SurfaceError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        SurfaceError::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn insufficient(required: usize, found: usize, context: impl Into<String>) -> Self {
        SurfaceError::InsufficientData {
            required,
            found,
            context: context.into(),
        }
    }
}

/// Non-fatal findings attached to a built surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SurfaceWarning {
    /// Total variance decreases between two adjacent maturities at fixed log-moneyness.
    CalendarArbitrage {
        log_moneyness: f64,
        t1: f64,
        t2: f64,
        w1: f64,
        w2: f64,
    },
    /// An SVI slice hit its iteration budget; the best feasible iterate was kept.
    CalibrationNonconvergent {
        maturity: f64,
        iterations: usize,
        objective: f64,
    },
}

/// Ensure a value is strictly positive and finite.
pub(crate) fn validate_positive(value: f64, name: &str) -> Result<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(SurfaceError::invalid(format!(
            "{name} must be positive and finite, got {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = SurfaceError::insufficient(3, 2, "SVI slice t=0.0822");
        let msg = format!("{err}");
        assert!(msg.contains("SVI slice"));
        assert!(msg.contains("need 3"));

        let err = SurfaceError::NoSolution {
            price: 0.5,
            lower: 1.0,
            upper: 100.0,
        };
        assert!(format!("{err}").contains("no-arbitrage"));
    }

    #[test]
    fn validate_positive_rejects_nan_and_zero() {
        assert!(validate_positive(1.0, "strike").is_ok());
        assert!(validate_positive(0.0, "strike").is_err());
        assert!(validate_positive(f64::NAN, "strike").is_err());
        assert!(validate_positive(f64::INFINITY, "strike").is_err());
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SurfaceError>();
    }
}
