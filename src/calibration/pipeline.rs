use std::sync::atomic::{AtomicUsize, Ordering};

use cmaes_lbfgsb::cmaes::{canonical_cmaes_optimize, CmaesCanonicalConfig};
use cmaes_lbfgsb::lbfgsb_optimize::lbfgsb_optimize;
use tracing::{debug, trace, warn};

use crate::calibration::config::SviConfig;
use crate::calibration::types::ModelCalibrator;

/// Result of one bounded optimisation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationOutcome {
    pub objective: f64,
    pub params: Vec<f64>,
    /// L-BFGS-B iterations consumed by the local refinement
    pub iterations: usize,
    /// False when the local refinement hit its iteration budget or aborted
    pub converged: bool,
    /// Bounds in force at the end (they grow under adaptive bounds)
    pub bounds: Vec<(f64, f64)>,
}

/// A calibration process for one model instance
pub struct CalibrationProcess {
    model: Box<dyn ModelCalibrator>,
    config: SviConfig,
    initial_guess: Option<Vec<f64>>,
}

impl CalibrationProcess {
    pub fn new(model: Box<dyn ModelCalibrator>, config: SviConfig) -> Self {
        Self {
            model,
            config,
            initial_guess: None,
        }
    }

    /// Set initial guess for optimization
    pub fn with_initial_guess(mut self, guess: Vec<f64>) -> Self {
        self.initial_guess = Some(guess);
        self
    }

    pub fn run(self) -> CalibrationOutcome {
        calibrate_model_adaptive(self.model, &self.config, self.initial_guess)
    }
}

fn cmaes_config(config: &SviConfig) -> CmaesCanonicalConfig {
    let cm = &config.cmaes;
    CmaesCanonicalConfig {
        population_size: cm.pop_size,
        max_generations: cm.max_gen,
        seed: cm.seed.unwrap_or(123456),
        c1: None,
        c_mu: None,
        c_sigma: None,
        d_sigma: None,
        parallel_eval: cm.parallel_eval,
        verbosity: cm.verbosity,
        ipop_restarts: cm.ipop_restarts,
        ipop_increase_factor: cm.ipop_increase_factor,
        bipop_restarts: cm.bipop_restarts,
        total_evals_budget: cm.total_evals_budget,
        use_subrun_budgeting: cm.use_subrun_budgeting,
        alpha_mu: None,
        hsig_threshold_factor: None,
        bipop_small_population_factor: None,
        bipop_small_budget_factor: None,
        bipop_large_budget_factor: None,
        bipop_large_pop_increase_factor: None,
        max_bound_iterations: None,
        eig_precision_threshold: None,
        min_eig_value: None,
        matrix_op_threshold: None,
        stagnation_limit: None,
        min_sigma: None,
    }
}

fn clamp_to_bounds(x: &mut [f64], bounds: &[(f64, f64)]) {
    for (v, &(lo, hi)) in x.iter_mut().zip(bounds) {
        *v = v.clamp(lo, hi);
    }
}

/// Bounded minimisation of the calibrator's objective.
///
/// Starts from `initial_guess` (clamped into bounds) or the box centre, optionally runs a
/// CMA-ES search around it, then refines with L-BFGS-B. The best of all candidates is
/// returned, so the result is never worse than the starting point.
pub fn calibrate_model(
    model: &dyn ModelCalibrator,
    config: &SviConfig,
    initial_guess: Option<Vec<f64>>,
) -> CalibrationOutcome {
    let bounds = model.param_bounds();
    let obj_fn = |x: &[f64]| model.evaluate_objective(x);

    let mut start = initial_guess
        .unwrap_or_else(|| bounds.iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect());
    clamp_to_bounds(&mut start, bounds);
    let start_obj = obj_fn(&start);
    trace!(model = model.model_name(), objective = start_obj, "initial point");

    // 1) optional global search centred on the starting point
    let (best_obj, best_sol) = if config.global_search {
        let cmaes_result =
            canonical_cmaes_optimize(obj_fn, bounds, cmaes_config(config), Some(start.clone()));
        let (_, cm_params) = cmaes_result.best_solution;
        let cm_obj = obj_fn(&cm_params);
        debug!(
            model = model.model_name(),
            before = start_obj,
            after = cm_obj,
            "CMA-ES search finished"
        );
        if cm_obj.is_finite() && cm_obj < start_obj {
            (cm_obj, cm_params)
        } else {
            (start_obj, start)
        }
    } else {
        (start_obj, start)
    };

    // 2) local refinement with L-BFGS-B
    let iterations = AtomicUsize::new(0);
    let mut refined_solution = best_sol.clone();
    let refine_res = lbfgsb_optimize(
        &mut refined_solution,
        bounds,
        &obj_fn,
        config.max_iter,
        config.tol,
        Some(|_current_x: &[f64], current_obj: f64| {
            let n = iterations.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(iteration = n, objective = current_obj, "L-BFGS-B iteration");
        }),
        None,
    );
    let iterations = iterations.load(Ordering::Relaxed);

    let (objective, params, converged) = match refine_res {
        Ok((loc_obj, loc_sol)) => {
            let converged = iterations < config.max_iter;
            if loc_obj.is_finite() && loc_obj < best_obj {
                debug!(
                    model = model.model_name(),
                    before = best_obj,
                    after = loc_obj,
                    iterations,
                    "L-BFGS-B improved objective"
                );
                (loc_obj, loc_sol, converged)
            } else {
                (best_obj, best_sol, converged)
            }
        }
        Err(e) => {
            warn!(
                model = model.model_name(),
                error = ?e,
                "L-BFGS-B aborted, keeping best candidate"
            );
            (best_obj, best_sol, false)
        }
    };

    CalibrationOutcome {
        objective,
        params,
        iterations,
        converged,
        bounds: bounds.to_vec(),
    }
}

/// Adaptive wrapper: re-runs the calibration with widened bounds while the optimum sits
/// near a bound.
pub fn calibrate_model_adaptive(
    mut model: Box<dyn ModelCalibrator>,
    config: &SviConfig,
    initial_guess: Option<Vec<f64>>,
) -> CalibrationOutcome {
    if !config.adaptive_bounds.enabled {
        return calibrate_model(&*model, config, initial_guess);
    }

    let mut best: Option<CalibrationOutcome> = None;
    for iter in 0..config.adaptive_bounds.max_iterations {
        let outcome = calibrate_model(&*model, config, initial_guess.clone());
        let adjusted = model.expand_bounds_if_needed(
            &outcome.params,
            config.adaptive_bounds.proximity_threshold,
            config.adaptive_bounds.expansion_factor,
        );
        debug!(
            iteration = iter + 1,
            objective = outcome.objective,
            expanded = adjusted,
            "adaptive bounds pass"
        );

        let improved = best
            .as_ref()
            .map_or(true, |b| outcome.objective < b.objective);
        if improved {
            best = Some(outcome);
        }
        if !adjusted {
            break;
        }
    }

    match best {
        Some(outcome) => outcome,
        // max_iterations == 0 behaves like a plain run
        None => calibrate_model(&*model, config, initial_guess),
    }
}
