use rand::{rngs::StdRng, Rng, SeedableRng};
use volvis_surface::{
    build_surface, default_configs, Black76, FlatMarket, MarketInputs, OptionType, PricingModel,
    Quote, SurfaceConfig, SurfaceType,
};

/// Synthetic chain priced off a skewed smile with a little price noise.
fn synthetic_chain(market: &FlatMarket, rng: &mut StdRng) -> Vec<Quote> {
    let mut quotes = Vec::new();
    for &t in &[1.0 / 12.0, 0.25, 0.5, 1.0] {
        let f = market.forward(t);
        let df = market.discount_factor(t);
        for i in 0..13 {
            let strike = 3600.0 + 150.0 * i as f64;
            let k = (strike / f).ln();
            let w = t * (0.03 + 0.1 * (-0.5 * k + (k * k + 0.04).sqrt()));
            let vol = (w / t).sqrt();
            let ot = if strike >= f { OptionType::Call } else { OptionType::Put };
            let fair = Black76.price(ot, f, strike, t, df, vol);
            let last = fair * (1.0 + rng.gen_range(-0.005..0.005));
            let mut q = Quote::with_price(ot, strike, t, last);
            q.bid = Some(last * 0.99);
            q.ask = Some(last * 1.01);
            q.volume = Some(rng.gen_range(0.0..500.0_f64).round());
            quotes.push(q);
        }
    }
    quotes
}

fn main() {
    let market = FlatMarket::new(4500.0, 0.045, 0.015);
    let mut rng = StdRng::seed_from_u64(42);
    let quotes = synthetic_chain(&market, &mut rng);
    println!("volvis-surface demo: {} quotes\n", quotes.len());

    for surfacetype in [
        SurfaceType::Svi,
        SurfaceType::Mesh,
        SurfaceType::Spline,
        SurfaceType::Trisurf,
    ] {
        let mut config = SurfaceConfig::default().with_surface_type(surfacetype);
        config.svi = default_configs::fast();
        config.filter.volume = 10.0;

        let surface = match build_surface(&quotes, &market, &config) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{surfacetype:?}: build failed: {e}");
                continue;
            }
        };
        let diag = surface.diagnostics();
        println!("{surfacetype:?}");
        println!(
            "   points: {}  rejected quotes: {}  failed solves: {}  warnings: {}",
            surface.points().len(),
            diag.filter.quotes_rejected,
            diag.quote_failures.len(),
            diag.warnings.len()
        );
        for fit in surface.svi_fits() {
            let p = fit.slice.params;
            println!(
                "   t={:.3} a={:.5} b={:.5} rho={:.3} m={:.4} sigma={:.4} rmse={:.2e} {:?}",
                p.t, p.a, p.b, p.rho, p.m, p.sigma, fit.vol_rmse, fit.status
            );
        }
        for &(t, pct) in &[(0.25, 90.0), (0.25, 100.0), (0.75, 100.0), (1.0, 110.0)] {
            match surface.vol(t, pct) {
                Ok(v) => println!("   vol(t={t}, {pct}%) = {:.2}%", v * 100.0),
                Err(e) => println!("   vol(t={t}, {pct}%) unavailable: {e}"),
            }
        }
        let grid = surface.sample_grid(25);
        let defined = grid.vols.iter().flatten().filter(|v| v.is_finite()).count();
        println!("   sampled grid: {defined}/{} points defined\n", 25 * 25);
    }
}
