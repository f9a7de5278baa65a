//! Trade-count driven upgrade and rollback of the live strategy genome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{Config, SchedulerConfig};
use crate::error::{AdaptError, Result};
use crate::evolution::{EvolutionEngine, EvolutionParams};
use crate::fitness::GenomeEvaluator;
use crate::genome::{GenomeSchema, StrategyGenome};
use crate::guard::{SafetyGuard, FITNESS_DROP};
use crate::logging::{log, log_persist_failure, log_upgrade, obj, ts_now, v_str, Domain, Level};
use crate::persist::{read_json, write_json_atomic};

pub const NOT_ENOUGH_TRADES_YET: &str = "not_enough_trades_yet";
pub const ALREADY_CHECKED_THIS_WINDOW: &str = "already_checked_this_window";
pub const NOT_IMPROVED_ENOUGH: &str = "not_improved_enough";
pub const UPGRADED: &str = "upgraded";
pub const UPGRADE_FAILED: &str = "upgrade_failed";
pub const NO_PREVIOUS_STRATEGY: &str = "no_previous_strategy";
pub const ROLLBACK_FAILED: &str = "rollback_failed";

/// Persisted genome with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub version: u64,
    pub timestamp: String,
    pub genome: StrategyGenome,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl StrategySnapshot {
    pub fn new(version: u64, genome: StrategyGenome) -> Self {
        Self { version, timestamp: ts_now(), genome, meta: BTreeMap::new() }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// The "live" and "previous" strategy files.
#[derive(Debug, Clone)]
pub struct StrategyStore {
    live_path: PathBuf,
    previous_path: PathBuf,
}

impl StrategyStore {
    pub fn new(live_path: impl Into<PathBuf>, previous_path: impl Into<PathBuf>) -> Self {
        Self { live_path: live_path.into(), previous_path: previous_path.into() }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.live_strategy_path(), cfg.previous_strategy_path())
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    pub fn previous_path(&self) -> &Path {
        &self.previous_path
    }

    fn load_at(path: &Path, schema: &GenomeSchema) -> Option<StrategySnapshot> {
        match read_json::<StrategySnapshot>(path) {
            Ok(Some(mut snap)) => {
                snap.genome = schema.clamp(&snap.genome);
                Some(snap)
            }
            Ok(None) => None,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Persist,
                    "strategy_load_failed",
                    obj(&[("path", v_str(&path.display().to_string())), ("msg", v_str(&err.to_string()))]),
                );
                None
            }
        }
    }

    /// Live snapshot, clamped to `schema`. Missing or malformed files read as `None`.
    pub fn load_live(&self, schema: &GenomeSchema) -> Option<StrategySnapshot> {
        Self::load_at(&self.live_path, schema)
    }

    pub fn load_previous(&self, schema: &GenomeSchema) -> Option<StrategySnapshot> {
        Self::load_at(&self.previous_path, schema)
    }

    /// Archive `current` then write `candidate` as live.
    pub fn promote(&self, candidate: &StrategySnapshot, current: &StrategySnapshot) -> Result<()> {
        write_json_atomic(&self.previous_path, current)?;
        write_json_atomic(&self.live_path, candidate)
    }

    /// Rewrite the archived genome as live under `version`.
    /// `Ok(None)` when there is nothing to restore.
    pub fn restore_previous(&self, schema: &GenomeSchema, version: u64) -> Result<Option<StrategySnapshot>> {
        let Some(previous) = self.load_previous(schema) else {
            return Ok(None);
        };
        let restored = StrategySnapshot::new(version, previous.genome.clone())
            .with_meta("source", "rollback")
            .with_meta("restored_from", previous.version);
        write_json_atomic(&self.live_path, &restored)?;
        Ok(Some(restored))
    }
}

/// Hook for consumers that cache the live genome.
pub trait StrategyReload: Send {
    fn reload(&mut self, genome: &StrategyGenome);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoReload;

impl StrategyReload for NoReload {
    fn reload(&mut self, _genome: &StrategyGenome) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpgradeReport {
    pub triggered: bool,
    pub upgraded: bool,
    pub reason: String,
    pub old_fitness: Option<f64>,
    pub new_fitness: Option<f64>,
    pub old_genome: Option<StrategyGenome>,
    pub new_genome: Option<StrategyGenome>,
}

impl UpgradeReport {
    fn skipped(reason: &str) -> Self {
        Self {
            triggered: false,
            upgraded: false,
            reason: reason.to_string(),
            old_fitness: None,
            new_fitness: None,
            old_genome: None,
            new_genome: None,
        }
    }

    fn rejected(reason: &str) -> Self {
        Self { triggered: true, ..Self::skipped(reason) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub checked: bool,
    pub rolled_back: bool,
    pub reason: String,
}

pub struct UpgradeScheduler {
    cfg: SchedulerConfig,
    engine: EvolutionEngine,
    seed: u64,
    schema: GenomeSchema,
    store: StrategyStore,
    guard: SafetyGuard,
    live: StrategySnapshot,
    reload: Box<dyn StrategyReload>,
    last_window: Option<u64>,
}

impl UpgradeScheduler {
    /// Loads the live strategy and guard state from `cfg.state_dir`.
    /// Invalid evolution parameters fail here, before any upgrade runs.
    pub fn new(cfg: &Config, schema: GenomeSchema, reload: Box<dyn StrategyReload>) -> Result<Self> {
        let engine = EvolutionEngine::new(EvolutionParams::from(&cfg.evolution))?;
        let store = StrategyStore::from_config(cfg);
        let guard = SafetyGuard::load(&cfg.guard, &cfg.guard_path());
        let live = store
            .load_live(&schema)
            .unwrap_or_else(|| StrategySnapshot::new(0, schema.default_genome()).with_meta("source", "default"));
        Ok(Self {
            cfg: cfg.scheduler.clone(),
            engine,
            seed: cfg.seed,
            schema,
            store,
            guard,
            live,
            reload,
            last_window: None,
        })
    }

    pub fn live(&self) -> &StrategySnapshot {
        &self.live
    }

    pub fn live_genome(&self) -> &StrategyGenome {
        &self.live.genome
    }

    pub fn schema(&self) -> &GenomeSchema {
        &self.schema
    }

    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    pub fn store(&self) -> &StrategyStore {
        &self.store
    }

    fn every_n(&self) -> u64 {
        self.cfg.every_n_trades.max(1)
    }

    /// Evolution RNG for one cadence window.
    fn window_rng(&self, window: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ window.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Run at most once per cadence window: gate, evolve, promote.
    pub fn maybe_upgrade(&mut self, trade_count: u64, samples: u64, evaluator: &dyn GenomeEvaluator) -> UpgradeReport {
        let every_n = self.every_n();
        if trade_count < every_n {
            return UpgradeReport::skipped(NOT_ENOUGH_TRADES_YET);
        }
        let window = trade_count / every_n;
        if self.last_window == Some(window) {
            return UpgradeReport::skipped(ALREADY_CHECKED_THIS_WINDOW);
        }
        self.last_window = Some(window);

        let gate = self.guard.can_upgrade(trade_count, samples);
        if !gate.allowed {
            log_upgrade("upgrade_skipped", gate.reason, None, None);
            return UpgradeReport::rejected(gate.reason);
        }

        match self.attempt_upgrade(trade_count, window, evaluator) {
            Ok(report) => report,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Upgrade,
                    UPGRADE_FAILED,
                    obj(&[("kind", v_str(err.kind())), ("msg", v_str(&err.to_string()))]),
                );
                UpgradeReport { old_genome: Some(self.live.genome.clone()), ..UpgradeReport::rejected(UPGRADE_FAILED) }
            }
        }
    }

    fn attempt_upgrade(&mut self, trade_count: u64, window: u64, evaluator: &dyn GenomeEvaluator) -> Result<UpgradeReport> {
        let old_genome = self.live.genome.clone();
        let baseline = evaluator
            .evaluate(&old_genome)
            .map_err(|e| AdaptError::Upgrade(format!("baseline evaluation failed: {}", e)))?;

        let mut rng = self.window_rng(window);
        let result = self.engine.run(&self.schema, evaluator, &mut rng)?;
        let candidate = result.best_fitness;

        let mut report = UpgradeReport {
            triggered: true,
            upgraded: false,
            reason: NOT_IMPROVED_ENOUGH.to_string(),
            old_fitness: Some(baseline),
            new_fitness: Some(candidate),
            old_genome: Some(old_genome),
            new_genome: Some(result.best_genome.clone()),
        };

        if !(candidate >= baseline + self.cfg.min_improve) {
            log_upgrade("upgrade_rejected", NOT_IMPROVED_ENOUGH, Some(baseline), Some(candidate));
            return Ok(report);
        }

        let next = StrategySnapshot::new(self.live.version + 1, result.best_genome)
            .with_meta("source", "evolution")
            .with_meta("reason", UPGRADED)
            .with_meta("fitness", candidate)
            .with_meta("baseline_fitness", baseline)
            .with_meta("trade_count", trade_count)
            .with_meta("window", window);
        self.store.promote(&next, &self.live)?;

        self.reload.reload(&next.genome);
        self.guard.mark_upgraded(trade_count, baseline, candidate);
        self.live = next;

        log_upgrade(UPGRADED, "fitness_improved", Some(baseline), Some(candidate));
        report.upgraded = true;
        report.reason = UPGRADED.to_string();
        Ok(report)
    }

    /// Check the active promotion against `observed_fitness` and restore the
    /// archived genome on a confirmed drop.
    pub fn maybe_rollback(&mut self, trade_count: u64, observed_fitness: f64) -> RollbackReport {
        let check = self.guard.should_rollback(trade_count, observed_fitness);
        let checked = check.drop.is_some() || check.rollback;
        if !check.rollback {
            if checked {
                self.guard.mark_stable();
            }
            return RollbackReport { checked, rolled_back: false, reason: check.reason.to_string() };
        }

        match self.store.restore_previous(&self.schema, self.live.version + 1) {
            Ok(Some(restored)) => {
                self.reload.reload(&restored.genome);
                self.live = restored;
                self.guard.mark_rolled_back();
                self.guard.clear();
                log(
                    Level::Warn,
                    Domain::Upgrade,
                    "rolled_back",
                    obj(&[
                        ("reason", v_str(FITNESS_DROP)),
                        ("observed_fitness", json!(observed_fitness)),
                        ("version", json!(self.live.version)),
                    ]),
                );
                RollbackReport { checked: true, rolled_back: true, reason: FITNESS_DROP.to_string() }
            }
            Ok(None) => {
                log_upgrade("rollback_skipped", NO_PREVIOUS_STRATEGY, None, Some(observed_fitness));
                RollbackReport { checked: true, rolled_back: false, reason: NO_PREVIOUS_STRATEGY.to_string() }
            }
            Err(err) => {
                log_persist_failure("strategy_live", &err);
                RollbackReport { checked: true, rolled_back: false, reason: ROLLBACK_FAILED.to_string() }
            }
        }
    }
}
