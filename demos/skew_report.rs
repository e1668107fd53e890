use std::env;

use volvis_surface::{
    build_surface, Black76, FlatMarket, MarketInputs, OptionType, PricingModel, Quote,
    SkewDirection, SkewReport, SurfaceConfig, SurfaceType,
};

fn main() -> anyhow::Result<()> {
    // usage: skew_report [months] [up|down|full] [config.toml]
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config = match args.get(2) {
        Some(path) => SurfaceConfig::from_toml_file(path)?,
        None => SurfaceConfig::default().with_surface_type(SurfaceType::Svi),
    };
    if let Some(months) = args.first() {
        config.skew.months = months.parse()?;
    }
    if let Some(direction) = args.get(1) {
        config.skew.direction = direction.parse::<SkewDirection>()?;
    }

    let market = FlatMarket::new(100.0, 0.03, 0.01);
    let mut quotes = Vec::new();
    for m in [1, 2, 3, 6, 9, 12, 18] {
        let t = m as f64 / 12.0;
        let (f, df) = (market.forward(t), market.discount_factor(t));
        for strike in (60..=140).step_by(5).map(f64::from) {
            let k = (strike / f).ln();
            let vol = (0.025 + 0.12 * (-0.6 * k + (k * k + 0.03).sqrt())).sqrt() * (1.0 + 0.05 * t);
            let ot = if strike >= f { OptionType::Call } else { OptionType::Put };
            quotes.push(Quote::with_price(ot, strike, t, Black76.price(ot, f, strike, t, df, vol)));
        }
    }

    let surface = build_surface(&quotes, &market, &config)?;
    println!(
        "{:?} surface, {} month skew ({:?})\n",
        surface.fit_method(),
        config.skew.months,
        config.skew.direction
    );
    print!("{}", SkewReport::from_config(&surface, &config.skew));
    Ok(())
}
