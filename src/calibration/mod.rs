//! Inputs, settings and the optimiser pipeline shared by every model.
//!
//! `types` holds the market-facing data (quotes, forwards, solved points), `config`
//! the serde-backed build settings and `pipeline` the CMA-ES / L-BFGS-B driver that
//! any [`types::ModelCalibrator`] can be handed to.

pub mod config;
pub mod pipeline;
pub mod types;
