//! Cooldown, grace window and rollback bookkeeping for live upgrades.
//!
//! ```text
//! Idle --mark_upgraded--> Upgraded --mark_stable--> Stable
//!                            |                         |
//!                            +----mark_rolled_back-----+--> RolledBack --clear--> Idle
//! ```
//!
//! A promotion from any phase overwrites the pending state; upgrades never
//! stack. The state is persisted after every mutation when a path is set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::GuardConfig;
use crate::logging::{log, log_guard, log_persist_failure, obj, v_str, Domain, Level};
use crate::persist::{read_json, write_json_atomic};

pub const NOT_ENOUGH_SAMPLES: &str = "not_enough_samples";
pub const COOLDOWN_ACTIVE: &str = "cooldown_active";
pub const ALLOWED: &str = "allowed";
pub const NO_ACTIVE_UPGRADE: &str = "no_active_upgrade";
pub const GRACE_WINDOW_ACTIVE: &str = "grace_window_active";
pub const STABLE: &str = "stable";
pub const FITNESS_DROP: &str = "fitness_drop";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardPhase {
    #[default]
    Idle,
    Upgraded,
    Stable,
    RolledBack,
}

impl GuardPhase {
    /// Phases in which a promoted genome is still watched for regression.
    pub fn is_monitored(&self) -> bool {
        matches!(self, GuardPhase::Upgraded | GuardPhase::Stable)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    pub phase: GuardPhase,
    pub last_upgrade_trade_count: Option<u64>,
    pub baseline_fitness: Option<f64>,
    pub trade_count_at_apply: Option<u64>,
    #[serde(default)]
    pub promoted_fitness: Option<f64>,
    #[serde(default)]
    pub upgrades: u64,
    #[serde(default)]
    pub rollbacks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeCheck {
    pub allowed: bool,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollbackCheck {
    pub rollback: bool,
    pub reason: &'static str,
    /// `baseline - observed`, once the grace window has passed.
    pub drop: Option<f64>,
}

pub struct SafetyGuard {
    cfg: GuardConfig,
    state: GuardState,
    path: Option<PathBuf>,
}

impl SafetyGuard {
    /// In-memory guard.
    pub fn new(cfg: &GuardConfig) -> Self {
        Self { cfg: cfg.clone(), state: GuardState::default(), path: None }
    }

    /// Guard backed by `path`. A missing or unreadable file starts Idle.
    pub fn load(cfg: &GuardConfig, path: &Path) -> Self {
        let state = match read_json::<GuardState>(path) {
            Ok(Some(state)) => state,
            Ok(None) => GuardState::default(),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Guard,
                    "state_reset",
                    obj(&[("path", v_str(&path.display().to_string())), ("msg", v_str(&err.to_string()))]),
                );
                GuardState::default()
            }
        };
        Self { cfg: cfg.clone(), state, path: Some(path.to_path_buf()) }
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    pub fn phase(&self) -> GuardPhase {
        self.state.phase
    }

    pub fn config(&self) -> &GuardConfig {
        &self.cfg
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Err(err) = write_json_atomic(path, &self.state) {
                log_persist_failure("guard", &err);
            }
        }
    }

    pub fn can_upgrade(&self, trade_count: u64, samples: u64) -> UpgradeCheck {
        let check = if samples < self.cfg.min_samples {
            UpgradeCheck { allowed: false, reason: NOT_ENOUGH_SAMPLES }
        } else {
            match self.state.last_upgrade_trade_count {
                Some(last) if trade_count.saturating_sub(last) < self.cfg.cooldown_trades => {
                    UpgradeCheck { allowed: false, reason: COOLDOWN_ACTIVE }
                }
                _ => UpgradeCheck { allowed: true, reason: ALLOWED },
            }
        };
        log_guard("can_upgrade", check.reason, trade_count);
        check
    }

    pub fn mark_upgraded(&mut self, trade_count: u64, old_fitness: f64, new_fitness: f64) {
        self.state.phase = GuardPhase::Upgraded;
        self.state.last_upgrade_trade_count = Some(trade_count);
        self.state.trade_count_at_apply = Some(trade_count);
        self.state.baseline_fitness = Some(old_fitness);
        self.state.promoted_fitness = Some(new_fitness);
        self.state.upgrades += 1;
        log_guard("mark_upgraded", "upgraded", trade_count);
        self.persist();
    }

    /// Pure check; the caller applies the verdict with `mark_stable` or
    /// `mark_rolled_back` once it knows whether the rollback can happen.
    pub fn should_rollback(&self, trade_count: u64, observed_fitness: f64) -> RollbackCheck {
        let (apply, baseline) = match (self.state.phase.is_monitored(), self.state.trade_count_at_apply, self.state.baseline_fitness) {
            (true, Some(apply), Some(baseline)) => (apply, baseline),
            _ => {
                log_guard("should_rollback", NO_ACTIVE_UPGRADE, trade_count);
                return RollbackCheck { rollback: false, reason: NO_ACTIVE_UPGRADE, drop: None };
            }
        };

        if trade_count.saturating_sub(apply) < self.cfg.grace_trades {
            log_guard("should_rollback", GRACE_WINDOW_ACTIVE, trade_count);
            return RollbackCheck { rollback: false, reason: GRACE_WINDOW_ACTIVE, drop: None };
        }

        // A non-finite observation cannot justify a rollback.
        let drop = baseline - observed_fitness;
        let check = if drop.is_finite() && drop >= self.cfg.rollback_drop {
            RollbackCheck { rollback: true, reason: FITNESS_DROP, drop: Some(drop) }
        } else {
            RollbackCheck { rollback: false, reason: STABLE, drop: drop.is_finite().then_some(drop) }
        };
        log_guard("should_rollback", check.reason, trade_count);
        check
    }

    pub fn mark_stable(&mut self) {
        if self.state.phase == GuardPhase::Upgraded {
            self.state.phase = GuardPhase::Stable;
            self.persist();
        }
    }

    pub fn mark_rolled_back(&mut self) {
        self.state.phase = GuardPhase::RolledBack;
        self.state.rollbacks += 1;
        self.persist();
    }

    /// Back to Idle. The cooldown anchor survives so a rollback does not
    /// open the door to an immediate re-upgrade.
    pub fn clear(&mut self) {
        self.state.phase = GuardPhase::Idle;
        self.state.baseline_fitness = None;
        self.state.trade_count_at_apply = None;
        self.state.promoted_fitness = None;
        self.persist();
    }
}
