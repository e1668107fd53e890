
use approx::assert_relative_eq;
use proptest::prelude::*;
use test_utils::{
    create_test_config, fixture_market, fixture_total_variance, load_chain, svi_points, FIXTURE,
};
use volvis_surface::models::traits::SurfaceModel;
use volvis_surface::{
    calibrate_svi, default_configs, evaluate_svi, CalibrationStatus, MarketInputs, SVIParams,
    SVISlice, SurfaceError, SurfaceType, SurfaceWarning, SviConfig, SviSurface,
    VolatilitySurface,
};

const KS: [f64; 9] = [-0.4, -0.3, -0.2, -0.1, 0.0, 0.1, 0.2, 0.3, 0.4];

/// Integration test for single-slice SVI calibration against a known smile.
#[test]
fn test_svi_calibration_recovers_smile() {
    let truth = [0.02, 0.12, -0.35, 0.02, 0.15];
    let t = 0.5;
    let points = svi_points(t, truth, &KS);

    let fit = calibrate_svi(&points, &default_configs::fast()).expect("calibration succeeds");
    assert_eq!(fit.points, KS.len());
    assert!(fit.vol_rmse < 5e-3, "vol rmse {}", fit.vol_rmse);

    let reference = SVISlice::new(SVIParams::from_slice(t, &truth).unwrap());
    for &k in &KS {
        let diff = (fit.slice.implied_vol(k) - reference.implied_vol(k)).abs();
        assert!(diff < 1e-2, "k={k}: diff {diff}");
    }
    assert!(fit.slice.validate_params().is_ok());
}

#[test]
fn test_evaluate_svi_matches_calibration_objective() {
    let truth = [0.02, 0.12, -0.35, 0.02, 0.15];
    let points = svi_points(0.5, truth, &KS);
    let config = default_configs::fast();

    let exact = SVIParams::from_slice(0.5, &truth).unwrap();
    let at_truth = evaluate_svi(&points, &exact, &config).unwrap();
    assert!(at_truth < 1e-12, "objective at generating params {at_truth}");

    let fit = calibrate_svi(&points, &config).unwrap();
    let at_fit = evaluate_svi(&points, &fit.slice.params, &config).unwrap();
    assert_relative_eq!(at_fit, fit.objective, epsilon = 1e-9);

    let shifted = SVIParams { a: 0.05, ..exact };
    assert!(evaluate_svi(&points, &shifted, &config).unwrap() > at_truth);
}

#[test]
fn test_two_points_is_insufficient_data() {
    let points = svi_points(0.25, [0.02, 0.1, 0.0, 0.0, 0.1], &[-0.1, 0.1]);
    match calibrate_svi(&points, &default_configs::minimal()) {
        Err(SurfaceError::InsufficientData { required, found, .. }) => {
            assert_eq!(required, 3);
            assert_eq!(found, 2);
        }
        other => panic!("expected InsufficientData, got {other:?}"),
    }
}

#[test]
fn test_multiple_expirations_rejected() {
    let mut points = svi_points(0.25, [0.02, 0.1, 0.0, 0.0, 0.1], &KS);
    points.extend(svi_points(0.5, [0.04, 0.1, 0.0, 0.0, 0.1], &KS));
    assert!(matches!(
        calibrate_svi(&points, &default_configs::minimal()),
        Err(SurfaceError::InvalidInput { .. })
    ));
}

/// Flat 20% smile at 30 days: the fit collapses to a constant total variance.
#[test]
fn test_flat_thirty_day_slice() {
    let t = 30.0 / 365.0;
    let w = 0.2 * 0.2 * t;
    let strikes = [90.0, 95.0, 100.0, 105.0, 110.0];
    let points: Vec<_> = strikes
        .iter()
        .map(|&k| {
            volvis_surface::ImpliedVolPoint::new(k, t, 100.0, 0.2, volvis_surface::OptionType::Call)
        })
        .collect();

    let fit = calibrate_svi(&points, &default_configs::fast()).unwrap();
    let p = fit.slice.params;
    assert!(p.b.abs() < 1e-4, "b = {}", p.b);
    assert!(p.rho.abs() < 1e-3, "rho = {}", p.rho);
    assert_relative_eq!(p.a, w, epsilon = 1e-5);
    for &k in &strikes {
        let lm = (k / 100.0f64).ln();
        assert_relative_eq!(fit.slice.implied_vol(lm), 0.2, epsilon = 1e-4);
    }
}

#[test]
fn test_fixture_surface_has_no_calendar_arbitrage() {
    let quotes = load_chain(FIXTURE).unwrap();
    let config = create_test_config().with_surface_type(SurfaceType::Svi);
    let surface = VolatilitySurface::build(&quotes, &fixture_market(), &config).unwrap();

    assert_eq!(surface.svi_fits().len(), 5);
    assert!(surface.diagnostics().slice_failures.is_empty());
    assert_eq!(surface.diagnostics().calendar_warnings().count(), 0);
    for fit in surface.svi_fits() {
        assert_eq!(fit.status, CalibrationStatus::Converged);
        assert!(fit.vol_rmse < 5e-3, "t={} rmse {}", fit.slice.maturity(), fit.vol_rmse);
    }

    // fitted total variance tracks the generating surface at the ATM forward
    let market = fixture_market();
    for fit in surface.svi_fits() {
        let t = fit.slice.maturity();
        let w = fit.slice.total_variance_at_k(0.0);
        assert!((w - fixture_total_variance(0.0, t)).abs() < 0.05 * w, "t={t}");
        let atm = surface.query(market.forward(t), t).unwrap();
        assert_relative_eq!(atm * atm * t, w, epsilon = 1e-9);
    }
}

/// Global search presets: CMA-ES ahead of L-BFGS-B, with adaptive bounds for research.
#[test]
fn test_global_search_presets_recover_smile() {
    let truth = [0.02, 0.12, -0.35, 0.02, 0.15];
    let points = svi_points(0.5, truth, &KS);
    let research = default_configs::research();
    assert!(research.global_search && research.adaptive_bounds.enabled);

    let presets = [
        ("production", default_configs::production()),
        ("research", research),
    ];
    for (name, config) in presets {
        let fit = calibrate_svi(&points, &config).unwrap();
        assert!(fit.vol_rmse < 5e-3, "{name}: vol rmse {}", fit.vol_rmse);
        assert!(fit.slice.validate_params().is_ok(), "{name}");
    }
}

/// A one-iteration budget cannot converge: every slice keeps its best iterate and
/// the surface reports the shortfall instead of failing.
#[test]
fn test_exhausted_budget_is_reported_as_warning() {
    let quotes = load_chain(FIXTURE).unwrap();
    let mut config = create_test_config().with_surface_type(SurfaceType::Svi);
    config.svi = SviConfig {
        max_iter: 1,
        compute_initial: false,
        ..default_configs::fast()
    };
    let surface = VolatilitySurface::build(&quotes, &fixture_market(), &config).unwrap();

    let fits = surface.svi_fits();
    assert_eq!(fits.len(), 5);
    for fit in fits {
        assert_eq!(
            fit.status,
            CalibrationStatus::Nonconvergent,
            "t={}",
            fit.slice.maturity()
        );
        assert!(fit.slice.validate_params().is_ok());
        assert!(fit.iterations >= 1);
    }

    let nonconvergent: Vec<_> = surface
        .diagnostics()
        .warnings
        .iter()
        .filter(|w| matches!(w, SurfaceWarning::CalibrationNonconvergent { .. }))
        .collect();
    assert_eq!(nonconvergent.len(), fits.len());
    assert!(!surface.diagnostics().is_clean());
    assert!(surface.query(100.0, 0.5).unwrap().is_finite());
}

#[test]
fn test_inverted_slices_raise_calendar_warnings() {
    let high = SVISlice::new(SVIParams::new(0.25, 0.05, 0.1, 0.0, 0.0, 0.1).unwrap());
    let low = SVISlice::new(SVIParams::new(0.5, 0.01, 0.1, 0.0, 0.0, 0.1).unwrap());
    let surface = SviSurface::new(vec![low, high], 1e-10).unwrap();
    let warnings = surface.calendar_warnings(&KS);
    assert_eq!(warnings.len(), KS.len());
    assert!(matches!(
        warnings[0],
        SurfaceWarning::CalendarArbitrage { t1, t2, .. } if t1 == 0.25 && t2 == 0.5
    ));
    assert!(surface.check_calendar_arbitrage(0.0, 0.25, 0.5).is_err());
}

proptest! {
    /// Raw SVI with b > 0 and |rho| < 1 is strictly convex in k.
    #[test]
    fn svi_is_convex_for_positive_b(
        a in -0.05f64..0.1,
        b in 0.01f64..1.0,
        rho in -0.95f64..0.95,
        m in -0.3f64..0.3,
        sigma in 0.01f64..1.0,
        k in -1.0f64..1.0,
    ) {
        prop_assume!(a + b * sigma * (1.0 - rho * rho).sqrt() >= 0.0);
        let slice = SVISlice::new(SVIParams::new(1.0, a, b, rho, m, sigma).unwrap());
        prop_assert!(slice.second_derivative(k) > 0.0);
        let h = 1e-3;
        let chord = 0.5 * (slice.total_variance_at_k(k - h) + slice.total_variance_at_k(k + h));
        prop_assert!(chord >= slice.total_variance_at_k(k));
    }
}
