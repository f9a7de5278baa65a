//! Per-step arbitration across policy variants.
//!
//! Raw scores are scaled by the (variant, regime) weight. The best allowed
//! decision wins; a weak winner or an all-deny step may be overridden by
//! epsilon-greedy exploration, which is capped, tagged and followed by a
//! cooldown measured in `tick()` calls.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ExplorationConfig;
use crate::features::FeatureSet;
use crate::logging::{log, log_decision, obj, v_str, Domain, Level};
use crate::policy::{Decision, EvalContext, PolicyRegistry};
use crate::weights::WeightStore;

pub const SOFT_EXPLORATION: &str = "soft_exploration";
pub const SAFE_EXPLORATION_KICKSTART: &str = "safe_exploration_kickstart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub steps: u64,
    pub forced: u64,
    pub variant_failures: u64,
}

pub struct PolicyArbiter {
    epsilon: f64,
    cooldown_steps: u32,
    cooldown_remaining: u32,
    soft_threshold: f64,
    forced_score_cap: f64,
    rng: StdRng,
    stats: ArbiterStats,
}

/// Index of the first maximum adjusted score; earlier entries win ties.
fn best_index<'a>(decisions: impl Iterator<Item = (usize, &'a Decision)>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, d) in decisions {
        let s = d.adjusted_score();
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i)
}

fn sanitize_epsilon(epsilon: f64) -> f64 {
    if epsilon.is_nan() {
        0.0
    } else {
        epsilon.clamp(0.0, 1.0)
    }
}

impl PolicyArbiter {
    pub fn new(cfg: &ExplorationConfig, seed: u64) -> Self {
        Self {
            epsilon: sanitize_epsilon(cfg.epsilon),
            cooldown_steps: cfg.cooldown_steps,
            cooldown_remaining: 0,
            soft_threshold: cfg.soft_threshold,
            forced_score_cap: cfg.forced_score_cap,
            rng: StdRng::seed_from_u64(seed),
            stats: ArbiterStats::default(),
        }
    }

    pub fn set_exploration(&mut self, epsilon: f64, cooldown_steps: u32) {
        self.epsilon = sanitize_epsilon(epsilon);
        self.cooldown_steps = cooldown_steps;
        self.cooldown_remaining = self.cooldown_remaining.min(cooldown_steps);
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn cooldown_remaining(&self) -> u32 {
        self.cooldown_remaining
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats
    }

    /// Advance the exploration cooldown by one arbitration cycle.
    /// Must be called exactly once per `arbitrate` call by the owner of the loop.
    pub fn tick(&mut self) {
        self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);
    }

    /// No RNG draw happens when exploration is disabled or cooling down.
    fn draw_exploration(&mut self) -> bool {
        if self.epsilon <= 0.0 || self.cooldown_remaining > 0 {
            return false;
        }
        self.rng.gen::<f64>() < self.epsilon
    }

    fn force(&mut self, mut d: Decision, reason: &str) -> Decision {
        d.allow = true;
        d.score = d.score.min(self.forced_score_cap);
        d.meta.adj_score = Some(d.adjusted_score().min(self.forced_score_cap));
        d.meta.forced = true;
        d.meta.forced_reason = Some(reason.to_string());
        self.cooldown_remaining = self.cooldown_steps;
        self.stats.forced += 1;
        d
    }

    /// Evaluate every variant and pick one decision for this step.
    pub fn arbitrate(
        &mut self,
        registry: &PolicyRegistry,
        weights: &WeightStore,
        features: &FeatureSet,
        ctx: &EvalContext<'_>,
    ) -> Decision {
        self.stats.steps += 1;
        let regime = ctx.regime.label();

        let mut decisions: Vec<Decision> = Vec::with_capacity(registry.len());
        for variant in registry.iter() {
            let id = variant.id();
            let mut d = match variant.evaluate(features, ctx) {
                Ok(d) if d.score.is_finite() => d,
                Ok(d) => {
                    self.stats.variant_failures += 1;
                    let mut failed = Decision::deny(id, 0.0);
                    failed.meta.error = Some(format!("non-finite score {}", d.score));
                    failed
                }
                Err(err) => {
                    self.stats.variant_failures += 1;
                    log(
                        Level::Warn,
                        Domain::Arbiter,
                        "variant_failed",
                        obj(&[("variant", v_str(id)), ("msg", v_str(&err.to_string()))]),
                    );
                    Decision::failed(id, &err)
                }
            };
            d.variant = id.to_string();

            let weight = weights.get(id, Some(regime));
            d.meta.regime = Some(regime.to_string());
            d.meta.weight = Some(weight);
            d.meta.base_score = Some(d.score);
            d.meta.adj_score = Some(d.score * weight);
            decisions.push(d);
        }

        if decisions.is_empty() {
            let mut d = Decision::deny("NONE", 0.0);
            d.meta.regime = Some(regime.to_string());
            d.meta.error = Some("no variants registered".to_string());
            return d;
        }

        let winner = best_index(decisions.iter().enumerate().filter(|(_, d)| d.allow));
        let global = best_index(decisions.iter().enumerate()).unwrap_or(0);

        let chosen = match winner {
            Some(w) => {
                if decisions[w].adjusted_score() < self.soft_threshold && self.draw_exploration() {
                    let d = decisions[global].clone();
                    self.force(d, SOFT_EXPLORATION)
                } else {
                    decisions[w].clone()
                }
            }
            None => {
                if self.draw_exploration() {
                    let d = decisions[global].clone();
                    self.force(d, SAFE_EXPLORATION_KICKSTART)
                } else {
                    decisions[global].clone()
                }
            }
        };

        let alternatives: Vec<(&str, f64)> = decisions
            .iter()
            .map(|d| (d.variant.as_str(), d.adjusted_score()))
            .collect();
        log_decision(
            &chosen.variant,
            regime,
            chosen.allow,
            chosen.score,
            chosen.meta.forced_reason.as_deref(),
            &alternatives,
        );

        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeightConfig;
    use crate::error::{AdaptError, Result};
    use crate::genome::{GenomeSchema, StrategyGenome};
    use crate::policy::PolicyVariant;
    use crate::regime::{Regime, RegimeContext};

    struct Fixed {
        id: &'static str,
        allow: bool,
        score: f64,
    }

    impl PolicyVariant for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        fn evaluate(&self, _f: &FeatureSet, _c: &EvalContext<'_>) -> Result<Decision> {
            Ok(if self.allow { Decision::allow(self.id, self.score) } else { Decision::deny(self.id, self.score) })
        }
    }

    struct Broken;

    impl PolicyVariant for Broken {
        fn id(&self) -> &str {
            "BROKEN"
        }

        fn evaluate(&self, _f: &FeatureSet, _c: &EvalContext<'_>) -> Result<Decision> {
            Err(AdaptError::VariantEvaluation { variant: "BROKEN".into(), reason: "boom".into() })
        }
    }

    fn registry(vs: Vec<Box<dyn PolicyVariant>>) -> PolicyRegistry {
        let mut r = PolicyRegistry::new();
        for v in vs {
            r.register(v).unwrap();
        }
        r
    }

    fn fixed(id: &'static str, allow: bool, score: f64) -> Box<dyn PolicyVariant> {
        Box::new(Fixed { id, allow, score })
    }

    fn cfg(epsilon: f64) -> ExplorationConfig {
        ExplorationConfig { epsilon, cooldown_steps: 3, soft_threshold: 0.35, forced_score_cap: 0.55 }
    }

    fn ctx(genome: &StrategyGenome) -> EvalContext<'_> {
        EvalContext {
            regime: RegimeContext { regime: Regime::Trending, confidence: 0.7, trend_strength: 0.5, vol_ratio: 1.0 },
            genome,
        }
    }

    fn weights() -> WeightStore {
        WeightStore::new(&WeightConfig::default()).unwrap()
    }

    #[test]
    fn weights_change_the_winner() {
        let reg = registry(vec![fixed("A", true, 0.6), fixed("B", true, 0.5)]);
        let mut w = weights();
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(0.0), 1);

        let d = arb.arbitrate(&reg, &w, &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "A");

        w.set("B", 2.0, Some("trending"));
        let d = arb.arbitrate(&reg, &w, &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "B");
        assert_eq!(d.meta.weight, Some(2.0));
        assert_eq!(d.meta.base_score, Some(0.5));
        assert_eq!(d.meta.adj_score, Some(1.0));
        assert_eq!(d.meta.regime.as_deref(), Some("trending"));
    }

    #[test]
    fn ties_go_to_registration_order() {
        let reg = registry(vec![fixed("FIRST", true, 0.5), fixed("SECOND", true, 0.5)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(0.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "FIRST");
    }

    #[test]
    fn failing_variant_is_denied_not_fatal() {
        let reg = registry(vec![Box::new(Broken) as Box<dyn PolicyVariant>, fixed("OK", true, 0.4)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(0.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "OK");
        assert!(d.allow);
        assert_eq!(arb.stats().variant_failures, 1);
    }

    #[test]
    fn all_deny_without_exploration_returns_best_deny() {
        let reg = registry(vec![fixed("A", false, 0.2), fixed("B", false, 0.3)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(0.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "B");
        assert!(!d.allow);
        assert!(!d.meta.forced);
    }

    #[test]
    fn kickstart_forces_best_deny_and_caps_score() {
        let reg = registry(vec![fixed("A", false, 0.9), fixed("B", false, 0.3)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(1.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "A");
        assert!(d.allow);
        assert!(d.meta.forced);
        assert_eq!(d.meta.forced_reason.as_deref(), Some(SAFE_EXPLORATION_KICKSTART));
        assert_eq!(d.score, 0.55);
        assert_eq!(arb.cooldown_remaining(), 3);
    }

    #[test]
    fn soft_exploration_overrides_weak_winner() {
        // Allowed winner is weak (0.2 < 0.35); the global best is a deny.
        let reg = registry(vec![fixed("WEAK", true, 0.2), fixed("STRONG_DENY", false, 0.8)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(1.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "STRONG_DENY");
        assert!(d.allow);
        assert_eq!(d.meta.forced_reason.as_deref(), Some(SOFT_EXPLORATION));
        assert!(d.score <= 0.55);
    }

    #[test]
    fn strong_winner_is_never_overridden() {
        let reg = registry(vec![fixed("A", true, 0.5), fixed("B", false, 0.9)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(1.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert_eq!(d.variant, "A");
        assert!(!d.meta.forced);
    }

    #[test]
    fn cooldown_blocks_until_ticked() {
        let reg = registry(vec![fixed("A", false, 0.4)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(1.0), 1);
        let f = FeatureSet::new();

        assert!(arb.arbitrate(&reg, &weights(), &f, &ctx(&g)).meta.forced);
        // Without ticks the cooldown never expires.
        for _ in 0..5 {
            assert!(!arb.arbitrate(&reg, &weights(), &f, &ctx(&g)).meta.forced);
        }
        for _ in 0..3 {
            arb.tick();
        }
        assert_eq!(arb.cooldown_remaining(), 0);
        assert!(arb.arbitrate(&reg, &weights(), &f, &ctx(&g)).meta.forced);
    }

    #[test]
    fn epsilon_zero_never_explores() {
        let reg = registry(vec![fixed("A", false, 0.4)]);
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(0.5), 1);
        arb.set_exploration(0.0, 0);
        for _ in 0..100 {
            let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
            assert!(!d.meta.forced);
            arb.tick();
        }
        assert_eq!(arb.stats().forced, 0);
    }

    #[test]
    fn same_seed_same_decisions() {
        let reg = registry(vec![fixed("A", true, 0.1), fixed("B", false, 0.3), fixed("C", false, 0.2)]);
        let g = GenomeSchema::default().default_genome();
        let run = |seed| {
            let mut arb = PolicyArbiter::new(&cfg(0.3), seed);
            let mut out = Vec::new();
            for _ in 0..200 {
                let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
                out.push((d.variant.clone(), d.allow, d.meta.forced));
                arb.tick();
            }
            out
        };
        assert_eq!(run(17), run(17));
    }

    #[test]
    fn empty_registry_denies() {
        let reg = PolicyRegistry::new();
        let g = GenomeSchema::default().default_genome();
        let mut arb = PolicyArbiter::new(&cfg(1.0), 1);
        let d = arb.arbitrate(&reg, &weights(), &FeatureSet::new(), &ctx(&g));
        assert!(!d.allow);
        assert_eq!(d.variant, "NONE");
    }
}
