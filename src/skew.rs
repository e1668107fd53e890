//! Tenor-by-strike skew table read off a built surface.
//!
//! Rows are whole months `1..=months` (maturity `m / 12`), columns are strikes
//! as a percentage of spot. Cells the surface cannot answer are left empty
//! rather than failing the report.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::config::SkewConfig;
use crate::error::SurfaceError;
use crate::surface::VolatilitySurface;

const ATM_PCT: f64 = 100.0;

/// Which side of the smile the report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkewDirection {
    /// 80, 90 and 100 % of spot
    #[default]
    Down,
    /// 100, 110 and 120 % of spot
    Up,
    /// 80 to 120 % in steps of 10
    Full,
}

impl SkewDirection {
    pub fn strikes_pct(self) -> Vec<f64> {
        match self {
            SkewDirection::Down => vec![80.0, 90.0, ATM_PCT],
            SkewDirection::Up => vec![ATM_PCT, 110.0, 120.0],
            SkewDirection::Full => vec![80.0, 90.0, ATM_PCT, 110.0, 120.0],
        }
    }
}

impl FromStr for SkewDirection {
    type Err = SurfaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "down" => Ok(SkewDirection::Down),
            "up" => Ok(SkewDirection::Up),
            "full" => Ok(SkewDirection::Full),
            other => Err(SurfaceError::invalid(format!(
                "unknown skew direction '{other}', expected up, down or full"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkewRow {
    pub months: usize,
    /// Year fraction
    pub maturity: f64,
    /// One entry per report strike
    pub vols: Vec<Option<f64>>,
    /// `vol(strike) - vol(ATM)` for every non-ATM strike
    pub skews: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkewReport {
    pub direction: SkewDirection,
    pub strikes_pct: Vec<f64>,
    pub rows: Vec<SkewRow>,
}

impl SkewReport {
    pub fn new(surface: &VolatilitySurface, months: usize, direction: SkewDirection) -> Self {
        let strikes_pct = direction.strikes_pct();
        let atm = strikes_pct.iter().position(|&p| p == ATM_PCT);

        let rows = (1..=months)
            .map(|m| {
                let maturity = m as f64 / 12.0;
                let vols: Vec<Option<f64>> = strikes_pct
                    .iter()
                    .map(|&pct| surface.vol(maturity, pct).ok())
                    .collect();
                let atm_vol = atm.and_then(|i| vols[i]);
                let skews = vols
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| Some(*i) != atm)
                    .map(|(_, v)| Some((*v)? - atm_vol?))
                    .collect();
                SkewRow {
                    months: m,
                    maturity,
                    vols,
                    skews,
                }
            })
            .collect();

        Self {
            direction,
            strikes_pct,
            rows,
        }
    }

    pub fn from_config(surface: &VolatilitySurface, config: &SkewConfig) -> Self {
        Self::new(surface, config.months, config.direction)
    }

    /// Labels of the skew columns, e.g. `80-100`.
    pub fn skew_labels(&self) -> Vec<String> {
        self.strikes_pct
            .iter()
            .filter(|&&p| p != ATM_PCT)
            .map(|p| format!("{p:.0}-{ATM_PCT:.0}"))
            .collect()
    }
}

fn cell(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v * 100.0))
}

impl fmt::Display for SkewReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>6}", "Month")?;
        for p in &self.strikes_pct {
            write!(f, "{:>9}", format!("{p:.0}%"))?;
        }
        for label in self.skew_labels() {
            write!(f, "{label:>9}")?;
        }
        writeln!(f)?;
        for row in &self.rows {
            write!(f, "{:>6}", row.months)?;
            for v in row.vols.iter().chain(&row.skews) {
                write!(f, "{:>9}", cell(*v))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
