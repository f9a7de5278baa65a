//! Session runner: replays a seeded synthetic candle stream through the agent.
//!
//! Usage: `adaptfx [bars] [seed]`. Everything else comes from the environment
//! (see `Config::from_env`).

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;

use adaptfx::features::{Candle, FeatureSet};
use adaptfx::genome::RiskConfig;
use adaptfx::logging::{log, obj, v_num, v_str, Domain, Level};
use adaptfx::regime::TrendVolClassifier;
use adaptfx::{Config, NoReload, OutcomeRecord, PolicyRegistry, TradingAgent};

fn generate_candles(seed: u64, n: usize, start_price: f64) -> Vec<Candle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = start_price;
    let mut vol: f64 = 0.002;
    let mut series = Vec::with_capacity(n);
    for i in 0..n {
        let regime_flip: f64 = rng.gen();
        if regime_flip < 0.02 {
            vol = (vol * 1.4).min(0.02);
        } else if regime_flip > 0.98 {
            vol = (vol * 0.7).max(0.0008);
        }
        let drift = if i % 240 < 120 { 0.0004 } else { -0.0002 };
        let ret = drift + rng.gen_range(-1.0..1.0) * vol;
        price = (price * (1.0 + ret)).max(1.0);
        series.push(Candle {
            ts: i as u64 * 300,
            o: price * (1.0 - vol * 0.2),
            h: price * (1.0 + vol * 0.5),
            l: price * (1.0 - vol * 0.5),
            c: price,
            v: rng.gen_range(50.0..200.0) * (1.0 + vol * 10.0),
        });
    }
    series
}

struct OpenPosition {
    direction: f64,
    entry: f64,
    bars: u32,
    features: FeatureSet,
    variant: String,
    regime: String,
    score: f64,
    risk: RiskConfig,
}

impl OpenPosition {
    /// Per-unit return if closed at `price`, or `None` while the position
    /// should stay open.
    fn exit_return(&self, price: f64) -> Option<f64> {
        let ret = self.direction * (price - self.entry) / self.entry;
        let exit = ret <= -self.risk.stop_loss || ret >= self.risk.take_profit || self.bars >= self.risk.max_hold_bars;
        exit.then_some(ret)
    }
}

#[derive(Default)]
struct SessionTotals {
    trades: u64,
    wins: u64,
    pnl: f64,
    upgrades: u64,
    rollbacks: u64,
}

fn parse_arg<T: std::str::FromStr>(args: &[String], idx: usize, name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match args.get(idx) {
        Some(raw) => raw.parse().with_context(|| format!("invalid {}: {}", name, raw)),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut cfg = Config::from_env();
    let bars: usize = parse_arg(&args, 1, "bars", 2000)?;
    cfg.seed = parse_arg(&args, 2, "seed", cfg.seed)?;

    let candles = generate_candles(cfg.seed, bars, 30_000.0);
    let classifier = TrendVolClassifier::new(cfg.regime_min_window);
    let mut agent = TradingAgent::new(
        cfg.clone(),
        PolicyRegistry::with_defaults(),
        Box::new(classifier),
        Box::new(NoReload),
    )?;

    log(
        Level::Info,
        Domain::System,
        "session_start",
        obj(&[
            ("bars", json!(bars)),
            ("seed", json!(cfg.seed)),
            ("state_dir", v_str(&cfg.state_dir.display().to_string())),
        ]),
    );

    let mut totals = SessionTotals::default();
    let mut position: Option<OpenPosition> = None;

    for candle in &candles {
        let features = agent.on_candle(candle);

        if let Some(pos) = position.as_mut() {
            pos.bars += 1;
            let Some(ret) = pos.exit_return(candle.c) else {
                continue;
            };
            let outcome = OutcomeRecord::from_pnl(ret, &pos.variant, &pos.regime, pos.score);
            agent.record_outcome(&pos.features, outcome);
            position = None;

            totals.trades += 1;
            totals.pnl += ret;
            if ret > 0.0 {
                totals.wins += 1;
            }

            if agent.maybe_upgrade().upgraded {
                totals.upgrades += 1;
            }
            let observed = agent.observed_fitness();
            if agent.maybe_rollback(observed).rolled_back {
                totals.rollbacks += 1;
            }
            continue;
        }

        let verdict = agent.evaluate_trade(&features);
        if !verdict.allow {
            continue;
        }
        let direction = if verdict.decision.side() == Some("sell") { -1.0 } else { 1.0 };
        position = Some(OpenPosition {
            direction,
            entry: candle.c,
            bars: 0,
            regime: agent.regime().label().to_string(),
            variant: verdict.decision.variant.clone(),
            score: verdict.score,
            risk: verdict.risk_config,
            features,
        });
    }

    let stats = agent.arbiter_stats();
    let win_rate = if totals.trades > 0 { totals.wins as f64 / totals.trades as f64 } else { 0.0 };
    log(
        Level::Info,
        Domain::System,
        "session_summary",
        obj(&[
            ("bars", json!(bars)),
            ("trades", json!(totals.trades)),
            ("win_rate", v_num(win_rate)),
            ("total_return", v_num(totals.pnl)),
            ("upgrades", json!(totals.upgrades)),
            ("rollbacks", json!(totals.rollbacks)),
            ("forced_explorations", json!(stats.forced)),
            ("variant_failures", json!(stats.variant_failures)),
            ("strategy_version", json!(agent.scheduler().live().version)),
            ("weights", json!(agent.weights().len())),
        ]),
    );
    Ok(())
}
