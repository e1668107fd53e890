
use approx::assert_relative_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use test_utils::{
    create_test_config, fixture_market, fixture_vol, flat_chain, load_chain, priced_quote, FIXTURE,
};
use volvis_surface::{
    build_surface, FilterConfig, FlatMarket, MarketInputs, OptionType, RbfKernel, SkewDirection,
    SkewReport, SurfaceConfig, SurfaceError, SurfaceType, VolatilitySurface,
};

const STRIKES: [f64; 5] = [90.0, 95.0, 100.0, 105.0, 110.0];

fn thirty_day_chain(market: &FlatMarket) -> Vec<volvis_surface::Quote> {
    flat_chain(market, 0.2, &[30.0 / 365.0], &STRIKES)
}

#[test]
fn flat_thirty_day_chain_svi() {
    let market = FlatMarket::new(100.0, 0.0, 0.0);
    let config = create_test_config().with_surface_type(SurfaceType::Svi);
    let surface = build_surface(&thirty_day_chain(&market), &market, &config).unwrap();

    let fit = &surface.svi_fits()[0];
    let t = 30.0 / 365.0;
    assert!(fit.slice.params.b.abs() < 1e-4);
    assert!(fit.slice.params.rho.abs() < 1e-3);
    assert_relative_eq!(fit.slice.params.a, 0.04 * t, epsilon = 1e-5);
    for &k in &STRIKES {
        assert_relative_eq!(surface.query(k, t).unwrap(), 0.2, epsilon = 1e-4);
    }
}

#[test]
fn flat_thirty_day_chain_mesh() {
    let market = FlatMarket::new(100.0, 0.0, 0.0);
    let config = create_test_config().with_surface_type(SurfaceType::Mesh);
    let surface = build_surface(&thirty_day_chain(&market), &market, &config).unwrap();
    assert!(surface.svi_fits().is_empty());

    let grid = surface.sample_grid(config.spacegrain);
    for row in &grid.vols {
        for v in row {
            assert!((v - 0.2).abs() < 1e-6, "grid vol {v}");
        }
    }
}

#[test]
fn below_intrinsic_quote_is_excluded() {
    let market = FlatMarket::new(100.0, 0.0, 0.0);
    let t = 30.0 / 365.0;
    let mut quotes = thirty_day_chain(&market);
    // deep ITM call offered below its intrinsic value of 15
    quotes.push(volvis_surface::Quote::with_price(OptionType::Call, 85.0, t, 14.0));

    let config = create_test_config().with_surface_type(SurfaceType::Svi);
    let surface = build_surface(&quotes, &market, &config).unwrap();

    let failures = &surface.diagnostics().quote_failures;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].strike, 85.0);
    assert!(matches!(failures[0].error, SurfaceError::NoSolution { .. }));
    assert_eq!(surface.points().len(), STRIKES.len());
    assert_eq!(surface.svi_fits().len(), 1);
    assert_relative_eq!(surface.query(100.0, t).unwrap(), 0.2, epsilon = 1e-4);
}

#[test]
fn thin_slice_is_recorded_not_fatal() {
    let market = FlatMarket::new(100.0, 0.0, 0.0);
    let mut quotes = flat_chain(&market, 0.2, &[0.25], &STRIKES);
    // two strikes pass minopts = 2 but are too few for SVI
    quotes.extend(flat_chain(&market, 0.25, &[0.5], &[95.0, 105.0]));
    let config = SurfaceConfig {
        filter: FilterConfig {
            minopts: 2,
            ..FilterConfig::default()
        },
        ..create_test_config().with_surface_type(SurfaceType::Svi)
    };
    let surface = build_surface(&quotes, &market, &config).unwrap();
    let failures = &surface.diagnostics().slice_failures;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].maturity, 0.5);
    assert!(matches!(failures[0].error, SurfaceError::InsufficientData { .. }));
    assert_eq!(surface.maturities(), vec![0.25]);
}

#[test]
fn all_slices_failing_is_empty_surface() {
    let market = FlatMarket::new(100.0, 0.0, 0.0);
    let quotes = flat_chain(&market, 0.2, &[0.25, 0.5], &[95.0, 105.0]);
    let config = SurfaceConfig {
        filter: FilterConfig {
            minopts: 2,
            ..FilterConfig::default()
        },
        ..create_test_config().with_surface_type(SurfaceType::Svi)
    };
    match build_surface(&quotes, &market, &config) {
        Err(SurfaceError::EmptySurface { slices_attempted }) => assert_eq!(slices_attempted, 2),
        other => panic!("expected EmptySurface, got {other:?}"),
    }
    // default minopts drops every slice before solving
    assert!(matches!(
        build_surface(&quotes, &market, &create_test_config()),
        Err(SurfaceError::EmptySurface { slices_attempted: 0 })
    ));
}

#[test]
fn interpolators_round_trip_fixture_samples() {
    let quotes = load_chain(FIXTURE).unwrap();
    let market = fixture_market();
    for surfacetype in [SurfaceType::Trisurf, SurfaceType::Mesh, SurfaceType::Spline] {
        let mut config = create_test_config().with_surface_type(surfacetype);
        config.rbffunc = RbfKernel::Multiquadric;
        let surface = build_surface(&quotes, &market, &config).unwrap();
        for p in surface.points() {
            let v = surface.query(p.strike, p.maturity).unwrap();
            assert!(
                (v - p.implied_vol).abs() < 1e-6,
                "{surfacetype:?} at ({}, {}): {v} vs {}",
                p.strike,
                p.maturity,
                p.implied_vol
            );
        }
    }
}

#[test]
fn svi_fixture_surface_tracks_generating_vols() {
    let quotes = load_chain(FIXTURE).unwrap();
    let config = create_test_config().with_surface_type(SurfaceType::InteractiveSvi);
    let surface = build_surface(&quotes, &fixture_market(), &config).unwrap();
    assert_eq!(surface.surface_type(), SurfaceType::InteractiveSvi);
    assert!(surface.svi_surface().is_some());

    // between slices the surface interpolates total variance, and the generating
    // surface is linear in t at fixed k, so interior maturities match too
    for &t in &[0.25, 0.375, 0.75] {
        for &k in &[85.0, 100.0, 115.0] {
            let v = surface.query(k, t).unwrap();
            assert!((v - fixture_vol(k, t)).abs() < 5e-3, "({k}, {t}): {v}");
        }
    }
}

#[test]
fn out_of_domain_queries_fail() {
    let quotes = load_chain(FIXTURE).unwrap();
    let surface = build_surface(&quotes, &fixture_market(), &create_test_config()).unwrap();
    let (k_min, k_max) = surface.strike_range();
    assert_eq!((k_min, k_max), (70.0, 130.0));

    // 25% of the 60-wide strike span is accepted beyond each edge
    assert!(surface.query(140.0, 0.5).is_ok());
    assert!(matches!(
        surface.query(200.0, 0.5),
        Err(SurfaceError::OutOfDomain { .. })
    ));
    assert!(matches!(
        surface.query(100.0, 3.0),
        Err(SurfaceError::OutOfDomain { .. })
    ));
    assert!(surface.query(100.0, 1.0 + 3.0 / 365.0).is_ok());

    let grid = surface.grid(&[100.0, 300.0], &[0.5]);
    assert!(grid[0][0].is_finite());
    assert!(grid[0][1].is_nan());
}

#[test]
fn monthlies_filter_drops_weekly_expiry() {
    let quotes = load_chain(FIXTURE).unwrap();
    let mut config = create_test_config();
    config.filter.monthlies = true;
    let surface = build_surface(&quotes, &fixture_market(), &config).unwrap();
    assert_eq!(surface.maturities().len(), 4);
    assert_eq!(surface.diagnostics().filter.quotes_rejected, 13);
}

#[test]
fn config_from_toml_drives_the_build() {
    let config = SurfaceConfig::from_toml_str(
        r#"
        surfacetype = "trisurf"
        voltype = "mid"

        [filter]
        minopts = 5
        "#,
    )
    .unwrap();
    let market = FlatMarket::new(100.0, 0.01, 0.0);
    let quotes: Vec<_> = flat_chain(&market, 0.3, &[0.25, 0.5], &STRIKES);
    let surface = VolatilitySurface::build(&quotes, &market, &config).unwrap();
    assert_eq!(surface.fit_method(), volvis_surface::FitMethod::Trisurf);
    assert_relative_eq!(surface.vol(0.375, 100.0).unwrap(), 0.3, epsilon = 1e-6);
}

#[test]
fn skew_report_from_fixture_surface() {
    let quotes = load_chain(FIXTURE).unwrap();
    let config = create_test_config().with_surface_type(SurfaceType::Svi);
    let surface = build_surface(&quotes, &fixture_market(), &config).unwrap();

    let report = SkewReport::new(&surface, 12, SkewDirection::Down);
    assert_eq!(report.rows.len(), 12);
    for row in &report.rows {
        // negative rho: downside strikes carry more vol than ATM
        let (s80, s90) = (row.skews[0].unwrap(), row.skews[1].unwrap());
        assert!(s80 > s90 && s90 > 0.0, "month {}: {s80} {s90}", row.months);
    }
    let text = report.to_string();
    assert!(text.contains("80-100"));
}

#[test]
fn fixture_prices_follow_black76_conventions() {
    let market = fixture_market();
    let q = priced_quote(&market, OptionType::Put, 90.0, 0.5, fixture_vol(90.0, 0.5));
    let fixture = load_chain(FIXTURE).unwrap();
    let row = fixture
        .iter()
        .find(|f| f.strike == 90.0 && (f.maturity - 0.5).abs() < 1e-12)
        .unwrap();
    assert_eq!(row.option_type, OptionType::Put);
    assert_relative_eq!(q.last.unwrap(), row.last.unwrap(), epsilon = 1e-9);
    assert!(market.forward(0.5) > market.spot());
}

#[test]
fn smoothing_tames_noisy_smiles() {
    let market = fixture_market();
    let mut rng = StdRng::seed_from_u64(7);
    let mut quotes = load_chain(FIXTURE).unwrap();
    for q in &mut quotes {
        let bump = 1.0 + rng.gen_range(-0.02..0.02);
        q.last = q.last.map(|p| p * bump);
    }

    let mut config = create_test_config();
    config.smoothing = true;
    config.order = 2;
    let surface = build_surface(&quotes, &market, &config).unwrap();
    for &t in &[0.25, 0.5, 1.0] {
        for &k in &[90.0, 100.0, 110.0] {
            let v = surface.query(k, t).unwrap();
            assert!((v - fixture_vol(k, t)).abs() < 0.02, "({k}, {t}): {v}");
        }
    }
}
