//! Built-in policy variants.
//!
//! Each one turns a normalized signal into a score in [0, 1] and allows the
//! trade when the score clears the live genome's `entry_threshold`.

use crate::error::{AdaptError, Result};
use crate::features::{FeatureSet, STRETCH, VOLUME_SPIKE, Z_MOMENTUM};
use crate::genome::{ENTRY_THRESHOLD, TREND_FILTER, VOL_FILTER};
use crate::regime::Regime;

use super::{Decision, EvalContext, PolicyVariant};

fn require(features: &FeatureSet, name: &str, variant: &str) -> Result<f64> {
    match features.get(name) {
        Some(v) if v.is_finite() => Ok(*v),
        Some(v) => Err(AdaptError::VariantEvaluation {
            variant: variant.to_string(),
            reason: format!("feature {} is not finite ({})", name, v),
        }),
        None => Err(AdaptError::VariantEvaluation {
            variant: variant.to_string(),
            reason: format!("missing feature {}", name),
        }),
    }
}

fn side(direction: f64) -> &'static str {
    if direction >= 0.0 {
        "buy"
    } else {
        "sell"
    }
}

fn finish(id: &str, strength: f64, direction: f64, blocked_by: Option<&str>, ctx: &EvalContext<'_>) -> Decision {
    let score = if strength.is_finite() { strength.clamp(0.0, 1.0) } else { 0.0 };
    let threshold = ctx.genome.get_or(ENTRY_THRESHOLD, 0.5);
    let allow = blocked_by.is_none() && score >= threshold;
    let mut d = if allow { Decision::allow(id, score) } else { Decision::deny(id, score) };
    d = d.with_extra("side", side(direction));
    if let Some(filter) = blocked_by {
        d = d.with_extra("filtered_by", filter);
    }
    d
}

/// Follows normalized momentum, boosted when the regime agrees.
#[derive(Debug, Clone)]
pub struct TrendFollow {
    pub z_threshold: f64,
}

impl Default for TrendFollow {
    fn default() -> Self {
        Self { z_threshold: 0.5 }
    }
}

impl PolicyVariant for TrendFollow {
    fn id(&self) -> &str {
        "TREND"
    }

    fn evaluate(&self, features: &FeatureSet, ctx: &EvalContext<'_>) -> Result<Decision> {
        let z = require(features, Z_MOMENTUM, self.id())?;
        let mut strength = ((z.abs() - self.z_threshold) / 2.5).max(0.0);
        if ctx.regime.regime == Regime::Trending && ctx.regime.trend_strength.signum() == z.signum() {
            strength *= 1.0 + 0.25 * ctx.regime.confidence;
        }
        let blocked = (ctx.genome.flag(TREND_FILTER) && ctx.regime.regime != Regime::Trending)
            .then_some(TREND_FILTER);
        Ok(finish(self.id(), strength, z, blocked, ctx))
    }
}

/// Fades stretched prices, damped in trending markets.
#[derive(Debug, Clone)]
pub struct MeanReversion {
    pub stretch_threshold: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self { stretch_threshold: 1.0 }
    }
}

impl PolicyVariant for MeanReversion {
    fn id(&self) -> &str {
        "MEAN_REV"
    }

    fn evaluate(&self, features: &FeatureSet, ctx: &EvalContext<'_>) -> Result<Decision> {
        let stretch = require(features, STRETCH, self.id())?;
        let mut strength = ((stretch.abs() - self.stretch_threshold) / 2.0).max(0.0);
        if ctx.regime.regime == Regime::Trending {
            strength *= 1.0 - 0.5 * ctx.regime.confidence;
        }
        let blocked = (ctx.genome.flag(VOL_FILTER) && ctx.regime.regime == Regime::Volatile)
            .then_some(VOL_FILTER);
        Ok(finish(self.id(), strength, -stretch, blocked, ctx))
    }
}

/// Volume-confirmed momentum bursts.
#[derive(Debug, Clone)]
pub struct Breakout {
    pub spike_threshold: f64,
}

impl Default for Breakout {
    fn default() -> Self {
        Self { spike_threshold: 1.5 }
    }
}

impl PolicyVariant for Breakout {
    fn id(&self) -> &str {
        "BREAKOUT"
    }

    fn evaluate(&self, features: &FeatureSet, ctx: &EvalContext<'_>) -> Result<Decision> {
        let spike = require(features, VOLUME_SPIKE, self.id())?;
        let z = require(features, Z_MOMENTUM, self.id())?;
        let strength = ((spike - self.spike_threshold) / 2.0).clamp(0.0, 1.0) * (z.abs() / 2.0).min(1.0);
        let blocked = (ctx.genome.flag(VOL_FILTER) && ctx.regime.regime == Regime::Volatile)
            .then_some(VOL_FILTER);
        Ok(finish(self.id(), strength, z, blocked, ctx))
    }
}
