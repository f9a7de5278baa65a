//! Agent facade: the surface a trading loop talks to.

use std::collections::VecDeque;

use serde_json::json;

use crate::arbiter::{ArbiterStats, PolicyArbiter};
use crate::config::Config;
use crate::error::Result;
use crate::features::{fingerprint, Candle, FeaturePipeline, FeatureSet};
use crate::fitness::{GenomeEvaluator, MemoryAggregator, OutcomeAggregator, ReplayFitness, TradeSample, PENALTY_FREE_SAMPLES};
use crate::genome::{GenomeSchema, RiskConfig, StrategyGenome};
use crate::learner::{OutcomeRecord, RewardLearner};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::policy::{Decision, EvalContext, PolicyRegistry};
use crate::regime::{RegimeClassifier, RegimeContext};
use crate::scheduler::{RollbackReport, StrategyReload, UpgradeReport, UpgradeScheduler};
use crate::weights::WeightStore;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeVerdict {
    pub allow: bool,
    pub score: f64,
    pub risk_config: RiskConfig,
    pub decision: Decision,
}

pub struct TradingAgent {
    config: Config,
    registry: PolicyRegistry,
    classifier: Box<dyn RegimeClassifier>,
    arbiter: PolicyArbiter,
    weights: WeightStore,
    learner: RewardLearner,
    pipeline: FeaturePipeline,
    window: VecDeque<Candle>,
    window_cap: usize,
    regime: RegimeContext,
    aggregator: MemoryAggregator,
    scheduler: UpgradeScheduler,
    trade_count: u64,
}

impl TradingAgent {
    /// Weights, live strategy and guard state are read from `config.state_dir`;
    /// missing or malformed files fall back to defaults. Only bad
    /// configuration is an error.
    pub fn new(
        config: Config,
        registry: PolicyRegistry,
        classifier: Box<dyn RegimeClassifier>,
        reload: Box<dyn StrategyReload>,
    ) -> Result<Self> {
        let weights = WeightStore::load(&config.weights_path(), &config.weights)?;
        let scheduler = UpgradeScheduler::new(&config, GenomeSchema::default(), reload)?;
        // Resume the trade clock at the last promotion so cadence and grace
        // windows stay meaningful after a restart.
        let trade_count = scheduler.guard().state().last_upgrade_trade_count.unwrap_or(0);
        let window_cap = config.feature_window.max(config.regime_min_window).max(1);

        log(
            Level::Info,
            Domain::System,
            "agent_started",
            obj(&[
                ("state_dir", v_str(&config.state_dir.display().to_string())),
                ("variants", json!(registry.ids())),
                ("weights_loaded", json!(weights.len())),
                ("strategy_version", json!(scheduler.live().version)),
                ("trade_count", json!(trade_count)),
            ]),
        );

        Ok(Self {
            arbiter: PolicyArbiter::new(&config.exploration, config.seed),
            learner: RewardLearner::new(&config.learner),
            pipeline: FeaturePipeline::new(config.feature_window),
            window: VecDeque::with_capacity(window_cap),
            window_cap,
            regime: RegimeContext::unknown(),
            aggregator: MemoryAggregator::new(),
            config,
            registry,
            classifier,
            weights,
            scheduler,
            trade_count,
        })
    }

    /// Feed one candle; returns the features for this step and refreshes the regime.
    pub fn on_candle(&mut self, candle: &Candle) -> FeatureSet {
        let features = self.pipeline.update(candle);
        self.window.push_back(*candle);
        while self.window.len() > self.window_cap {
            self.window.pop_front();
        }

        let next = self.classifier.detect(self.window.make_contiguous());
        if next.regime != self.regime.regime {
            log(
                Level::Debug,
                Domain::Regime,
                "regime_change",
                obj(&[
                    ("from", v_str(self.regime.label())),
                    ("to", v_str(next.label())),
                    ("confidence", v_num(next.confidence)),
                ]),
            );
        }
        self.regime = next;
        features
    }

    /// Arbitrate one step. Ticks the exploration cooldown exactly once.
    pub fn evaluate_trade(&mut self, features: &FeatureSet) -> TradeVerdict {
        let ctx = EvalContext { regime: self.regime, genome: self.scheduler.live_genome() };
        let decision = self.arbiter.arbitrate(&self.registry, &self.weights, features, &ctx);
        self.arbiter.tick();
        TradeVerdict {
            allow: decision.allow,
            score: decision.score,
            risk_config: RiskConfig::from_genome(self.scheduler.live_genome()),
            decision,
        }
    }

    pub fn set_exploration(&mut self, epsilon: f64, cooldown_steps: u32) {
        self.arbiter.set_exploration(epsilon, cooldown_steps);
    }

    /// Learn from a closed trade. `features` are the ones the trade was
    /// opened on. Returns the reward applied.
    pub fn record_outcome(&mut self, features: &FeatureSet, outcome: OutcomeRecord) -> f64 {
        let reward = self
            .learner
            .apply_and_persist(&mut self.weights, &outcome, &self.config.weights_path());
        self.aggregator.record(&fingerprint(features), &outcome);
        self.trade_count += 1;
        reward
    }

    fn trail_since(&self, last_n: Option<usize>) -> Vec<TradeSample> {
        let mut trail = self.aggregator.trail();
        if let Some(n) = last_n {
            let skip = trail.len().saturating_sub(n);
            trail.drain(..skip);
        }
        trail
    }

    pub fn maybe_upgrade(&mut self) -> UpgradeReport {
        let evaluator = ReplayFitness::new(self.trail_since(None));
        let samples = self.aggregator.overall().samples;
        self.scheduler.maybe_upgrade(self.trade_count, samples, &evaluator)
    }

    pub fn maybe_rollback(&mut self, observed_fitness: f64) -> RollbackReport {
        self.scheduler.maybe_rollback(self.trade_count, observed_fitness)
    }

    /// Fitness of the live genome over every trade closed since the last
    /// promotion (the whole trail when nothing was promoted), sized and
    /// clipped by the live genome but not re-filtered by it.
    ///
    /// NaN until the window holds `PENALTY_FREE_SAMPLES` trades: the
    /// promotion baseline was scored on a full trail, and a thinner window
    /// would carry a sample penalty the baseline never paid.
    pub fn observed_fitness(&self) -> f64 {
        let since = self
            .scheduler
            .guard()
            .state()
            .trade_count_at_apply
            .map(|apply| self.trade_count.saturating_sub(apply) as usize);
        let trail = self.trail_since(since);
        if (trail.len() as u64) < PENALTY_FREE_SAMPLES {
            return f64::NAN;
        }
        ReplayFitness::realized(trail)
            .evaluate(self.scheduler.live_genome())
            .unwrap_or(f64::NAN)
    }

    pub fn regime(&self) -> &RegimeContext {
        &self.regime
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count
    }

    pub fn weights(&self) -> &WeightStore {
        &self.weights
    }

    pub fn aggregator(&self) -> &MemoryAggregator {
        &self.aggregator
    }

    pub fn scheduler(&self) -> &UpgradeScheduler {
        &self.scheduler
    }

    pub fn live_genome(&self) -> &StrategyGenome {
        self.scheduler.live_genome()
    }

    pub fn arbiter_stats(&self) -> ArbiterStats {
        self.arbiter.stats()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
