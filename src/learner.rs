//! Turns closed-trade outcomes into weight updates.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::LearnerConfig;
use crate::logging::{log_persist_failure, log_reward};
use crate::weights::WeightStore;

pub const UNKNOWN_VARIANT: &str = "UNKNOWN_EXPERT";
pub const UNKNOWN_REGIME: &str = "UNKNOWN";

/// Realized result of one closed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub pnl: f64,
    pub win: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub regime: Option<String>,
    /// Arbitrated score at entry.
    #[serde(default)]
    pub score: f64,
}

impl OutcomeRecord {
    /// `win` follows the sign of `pnl`.
    pub fn from_pnl(pnl: f64, variant: &str, regime: &str, score: f64) -> Self {
        Self {
            pnl,
            win: pnl > 0.0,
            variant: Some(variant.to_string()),
            regime: Some(regime.to_string()),
            score,
        }
    }

    pub fn variant_or_unknown(&self) -> &str {
        self.variant.as_deref().filter(|s| !s.is_empty()).unwrap_or(UNKNOWN_VARIANT)
    }

    pub fn regime_or_unknown(&self) -> &str {
        self.regime.as_deref().filter(|s| !s.is_empty()).unwrap_or(UNKNOWN_REGIME)
    }
}

#[derive(Debug, Clone)]
pub struct RewardLearner {
    learning_rate: f64,
    pnl_clip: f64,
}

impl RewardLearner {
    pub fn new(cfg: &LearnerConfig) -> Self {
        Self {
            learning_rate: cfg.learning_rate,
            pnl_clip: if cfg.pnl_clip > 0.0 { cfg.pnl_clip } else { 3.0 },
        }
    }

    /// `±1` for the win flag plus up to `±0.5` from clipped pnl.
    pub fn reward(&self, outcome: &OutcomeRecord) -> f64 {
        let base = if outcome.win { 1.0 } else { -1.0 };
        let pnl = if outcome.pnl.is_finite() { outcome.pnl } else { 0.0 };
        let clipped = pnl.clamp(-self.pnl_clip, self.pnl_clip);
        base + 0.5 * clipped / self.pnl_clip
    }

    /// Apply the outcome to `weights`; returns the reward used.
    pub fn apply(&self, weights: &mut WeightStore, outcome: &OutcomeRecord) -> f64 {
        let reward = self.reward(outcome);
        let variant = outcome.variant_or_unknown();
        let regime = outcome.regime_or_unknown();
        let after = weights.update(variant, self.learning_rate * reward, Some(regime));
        log_reward(variant, regime, reward, after);
        reward
    }

    /// Apply and persist. A failed save is logged and dropped; the in-memory
    /// weights stay authoritative.
    pub fn apply_and_persist(&self, weights: &mut WeightStore, outcome: &OutcomeRecord, path: &Path) -> f64 {
        let reward = self.apply(weights, outcome);
        if let Err(err) = weights.save(path) {
            log_persist_failure("weights", &err);
        }
        reward
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightConfig;

    fn learner() -> RewardLearner {
        RewardLearner::new(&LearnerConfig::default())
    }

    #[test]
    fn reward_formula() {
        let l = learner();
        let win = OutcomeRecord::from_pnl(1.5, "TREND", "trending", 0.6);
        assert!((l.reward(&win) - 1.25).abs() < 1e-12);
        let big_win = OutcomeRecord::from_pnl(100.0, "TREND", "trending", 0.6);
        assert!((l.reward(&big_win) - 1.5).abs() < 1e-12);
        let loss = OutcomeRecord::from_pnl(-3.0, "TREND", "trending", 0.6);
        assert!((l.reward(&loss) + 1.5).abs() < 1e-12);
    }

    #[test]
    fn apply_moves_regime_weight() {
        let l = learner();
        let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
        let r = l.apply(&mut w, &OutcomeRecord::from_pnl(3.0, "TREND", "trending", 0.5));
        assert!((r - 1.5).abs() < 1e-12);
        assert!((w.get("TREND", Some("trending")) - 1.075).abs() < 1e-12);
        assert_eq!(w.get("TREND", None), 1.0);
    }

    #[test]
    fn missing_tags_use_sentinels() {
        let l = learner();
        let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
        let o = OutcomeRecord { pnl: -1.0, win: false, variant: None, regime: Some(String::new()), score: 0.0 };
        l.apply(&mut w, &o);
        assert!(w.get(UNKNOWN_VARIANT, Some(UNKNOWN_REGIME)) < 1.0);
        assert!(w.iter().any(|(k, _)| k == "UNKNOWN::UNKNOWN_EXPERT"));
    }

    #[test]
    fn persistence_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("weights.json");
        std::fs::create_dir_all(path.join("blocker")).unwrap();
        let l = learner();
        let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
        let r = l.apply_and_persist(&mut w, &OutcomeRecord::from_pnl(1.0, "A", "ranging", 0.4), &path);
        assert!(r > 0.0);
        assert!(w.get("A", Some("ranging")) > 1.0);
    }

    #[test]
    fn persisted_weights_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        let l = learner();
        let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
        l.apply_and_persist(&mut w, &OutcomeRecord::from_pnl(2.0, "A", "ranging", 0.4), &path);
        let back = WeightStore::load(&path, &WeightConfig::default()).unwrap();
        assert_eq!(back, w);
    }
}
