//! Option chain eligibility and grouping into maturity slices.
//!
//! The acquisition layer already applies most of these thresholds; they are
//! re-applied here so only eligible quotes reach the solver.

use serde::Serialize;
use tracing::debug;

use crate::calibration::config::{FilterConfig, SurfaceConfig};
use crate::calibration::types::{Quote, MATURITY_EPSILON};

const DAYS_PER_YEAR: f64 = 365.0;

/// Quotes sharing one maturity, sorted by strike.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaturitySlice {
    /// Year fraction
    pub time_to_expiry: f64,
    pub quotes: Vec<Quote>,
}

impl MaturitySlice {
    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn strikes(&self) -> Vec<f64> {
        self.quotes.iter().map(|q| q.strike).collect()
    }
}

/// Counts of what the filter removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterSummary {
    pub quotes_in: usize,
    pub quotes_rejected: usize,
    /// Slices dropped for having fewer than `minopts` quotes
    pub slices_dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChainFilter {
    config: FilterConfig,
}

impl ChainFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &SurfaceConfig) -> Self {
        Self::new(config.filter.clone())
    }

    /// Quote-level eligibility. Missing volume or open interest passes.
    pub fn accepts(&self, quote: &Quote) -> bool {
        let cfg = &self.config;
        if !(quote.strike.is_finite() && quote.strike > 0.0) {
            return false;
        }
        if !(quote.maturity.is_finite() && quote.maturity > 0.0) {
            return false;
        }
        if quote.maturity * DAYS_PER_YEAR < cfg.mindays {
            return false;
        }
        if cfg.monthlies && !quote.standard_expiry {
            return false;
        }
        if quote.volume.is_some_and(|v| v < cfg.volume) {
            return false;
        }
        if quote.open_interest.is_some_and(|oi| oi < cfg.openint) {
            return false;
        }
        true
    }

    /// Eligible quotes grouped by maturity; slices thinner than `minopts` dropped.
    pub fn group_slices(&self, quotes: &[Quote]) -> Vec<MaturitySlice> {
        self.apply(quotes).0
    }

    pub fn apply(&self, quotes: &[Quote]) -> (Vec<MaturitySlice>, FilterSummary) {
        let mut kept: Vec<Quote> = quotes.iter().filter(|q| self.accepts(q)).cloned().collect();
        let mut summary = FilterSummary {
            quotes_in: quotes.len(),
            quotes_rejected: quotes.len() - kept.len(),
            slices_dropped: 0,
        };

        kept.sort_by(|a, b| {
            a.maturity
                .total_cmp(&b.maturity)
                .then(a.strike.total_cmp(&b.strike))
        });

        let mut slices: Vec<MaturitySlice> = Vec::new();
        for q in kept {
            match slices.last_mut() {
                Some(s) if (q.maturity - s.time_to_expiry).abs() < MATURITY_EPSILON => {
                    s.quotes.push(q)
                }
                _ => slices.push(MaturitySlice {
                    time_to_expiry: q.maturity,
                    quotes: vec![q],
                }),
            }
        }

        let before = slices.len();
        slices.retain(|s| s.len() >= self.config.minopts);
        summary.slices_dropped = before - slices.len();

        debug!(
            quotes_in = summary.quotes_in,
            rejected = summary.quotes_rejected,
            slices = slices.len(),
            slices_dropped = summary.slices_dropped,
            "chain filtered"
        );
        (slices, summary)
    }
}
