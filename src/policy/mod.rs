//! Policy variants and the registry the arbiter draws them from.

pub mod variants;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AdaptError, Result};
use crate::features::FeatureSet;
use crate::genome::StrategyGenome;
use crate::regime::RegimeContext;

pub use variants::{Breakout, MeanReversion, TrendFollow};

/// Decision annotations.
///
/// The core keys are typed; anything a variant wants to attach beyond them
/// goes into `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adj_score: Option<f64>,
    #[serde(default)]
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// One variant's recommendation for the current step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    pub score: f64,
    pub variant: String,
    pub meta: DecisionMeta,
}

impl Decision {
    pub fn allow(variant: &str, score: f64) -> Self {
        Self { allow: true, score, variant: variant.to_string(), meta: DecisionMeta::default() }
    }

    pub fn deny(variant: &str, score: f64) -> Self {
        Self { allow: false, score, variant: variant.to_string(), meta: DecisionMeta::default() }
    }

    /// Deny produced from a failed evaluation.
    pub fn failed(variant: &str, err: &AdaptError) -> Self {
        let mut d = Self::deny(variant, 0.0);
        d.meta.error = Some(err.to_string());
        d
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.extra.insert(key.to_string(), value.into());
        self
    }

    /// Weighted score when annotated, raw score otherwise.
    pub fn adjusted_score(&self) -> f64 {
        self.meta.adj_score.unwrap_or(self.score)
    }

    /// Trade side attached by the built-in variants ("buy" / "sell").
    pub fn side(&self) -> Option<&str> {
        self.meta.extra.get("side").and_then(|v| v.as_str())
    }
}

/// What a variant sees besides the features.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub regime: RegimeContext,
    pub genome: &'a StrategyGenome,
}

pub trait PolicyVariant: Send + Sync {
    fn id(&self) -> &str;

    /// Prefer returning a deny over an error; the arbiter tolerates both.
    fn evaluate(&self, features: &FeatureSet, ctx: &EvalContext<'_>) -> Result<Decision>;
}

/// Ordered collection of variants. Built once and passed by reference.
#[derive(Default)]
pub struct PolicyRegistry {
    variants: Vec<Box<dyn PolicyVariant>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// TREND, MEAN_REV, BREAKOUT in that order.
    pub fn with_defaults() -> Self {
        Self {
            variants: vec![
                Box::new(TrendFollow::default()),
                Box::new(MeanReversion::default()),
                Box::new(Breakout::default()),
            ],
        }
    }

    pub fn register(&mut self, variant: Box<dyn PolicyVariant>) -> Result<()> {
        if self.variants.iter().any(|v| v.id() == variant.id()) {
            return Err(AdaptError::Configuration(format!(
                "variant {} registered twice",
                variant.id()
            )));
        }
        self.variants.push(variant);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn PolicyVariant> {
        self.variants.iter().map(|v| v.as_ref())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.variants.iter().map(|v| v.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    impl PolicyVariant for Fixed {
        fn id(&self) -> &str {
            self.0
        }

        fn evaluate(&self, _features: &FeatureSet, _ctx: &EvalContext<'_>) -> Result<Decision> {
            Ok(Decision::allow(self.0, 0.5))
        }
    }

    #[test]
    fn registry_preserves_order_and_rejects_duplicates() {
        let mut reg = PolicyRegistry::new();
        reg.register(Box::new(Fixed("B"))).unwrap();
        reg.register(Box::new(Fixed("A"))).unwrap();
        assert_eq!(reg.ids(), vec!["B", "A"]);
        let err = reg.register(Box::new(Fixed("A"))).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn defaults_registered() {
        let reg = PolicyRegistry::with_defaults();
        assert_eq!(reg.ids(), vec!["TREND", "MEAN_REV", "BREAKOUT"]);
    }

    #[test]
    fn failed_decision_denies_with_error() {
        let err = AdaptError::Data("missing feature".into());
        let d = Decision::failed("X", &err);
        assert!(!d.allow);
        assert_eq!(d.score, 0.0);
        assert!(d.meta.error.as_deref().unwrap().contains("missing feature"));
    }

    #[test]
    fn meta_serializes_core_keys_only_when_set() {
        let d = Decision::allow("X", 0.4).with_extra("side", "buy");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["meta"]["extra"]["side"], "buy");
        assert!(v["meta"].get("weight").is_none());
        assert_eq!(d.side(), Some("buy"));
        assert_eq!(d.adjusted_score(), 0.4);
    }
}
