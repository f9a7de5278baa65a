//! Bounded confidence weights keyed by (variant, regime).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::WeightConfig;
use crate::error::{AdaptError, Result};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::persist::{read_json, write_json_atomic};

/// On-disk layout. Entries are kept as raw JSON so one bad value does not
/// invalidate the rest of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub default_weight: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightStore {
    default_weight: f64,
    min_weight: f64,
    max_weight: f64,
    weights: BTreeMap<String, f64>,
}

/// `"<regime>::<variant>"`, or the bare variant when no regime applies.
pub fn weight_key(variant: &str, regime: Option<&str>) -> String {
    match regime {
        Some(r) => format!("{}::{}", r, variant),
        None => variant.to_string(),
    }
}

fn valid_bounds(default: f64, min: f64, max: f64) -> bool {
    default.is_finite() && min.is_finite() && max.is_finite() && min <= max
}

impl WeightStore {
    pub fn new(cfg: &WeightConfig) -> Result<Self> {
        if !valid_bounds(cfg.default_weight, cfg.min_weight, cfg.max_weight) {
            return Err(AdaptError::Configuration(format!(
                "invalid weight bounds: default={} min={} max={}",
                cfg.default_weight, cfg.min_weight, cfg.max_weight
            )));
        }
        Ok(Self {
            default_weight: cfg.default_weight.clamp(cfg.min_weight, cfg.max_weight),
            min_weight: cfg.min_weight,
            max_weight: cfg.max_weight,
            weights: BTreeMap::new(),
        })
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min_weight, self.max_weight)
    }

    pub fn default_weight(&self) -> f64 {
        self.default_weight
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn get(&self, variant: &str, regime: Option<&str>) -> f64 {
        self.weights
            .get(&weight_key(variant, regime))
            .copied()
            .unwrap_or(self.default_weight)
    }

    /// Store `w` clamped into bounds. NaN is rejected and leaves the entry untouched.
    pub fn set(&mut self, variant: &str, w: f64, regime: Option<&str>) -> f64 {
        if w.is_nan() {
            return self.get(variant, regime);
        }
        let clamped = w.clamp(self.min_weight, self.max_weight);
        self.weights.insert(weight_key(variant, regime), clamped);
        clamped
    }

    pub fn update(&mut self, variant: &str, delta: f64, regime: Option<&str>) -> f64 {
        let cur = self.get(variant, regime);
        self.set(variant, cur + delta, regime)
    }

    pub fn multiply(&mut self, variant: &str, factor: f64, regime: Option<&str>) -> f64 {
        let cur = self.get(variant, regime);
        self.set(variant, cur * factor, regime)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn to_snapshot(&self) -> WeightSnapshot {
        WeightSnapshot {
            default_weight: self.default_weight,
            min_weight: self.min_weight,
            max_weight: self.max_weight,
            weights: self.weights.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect(),
        }
    }

    /// Rebuild from a snapshot. Bounds come from the snapshot when they are
    /// coherent, otherwise from `fallback`; non-numeric entries are dropped.
    pub fn from_snapshot(snap: WeightSnapshot, fallback: &WeightConfig) -> Result<Self> {
        let mut store = if valid_bounds(snap.default_weight, snap.min_weight, snap.max_weight) {
            Self::new(&WeightConfig {
                default_weight: snap.default_weight,
                min_weight: snap.min_weight,
                max_weight: snap.max_weight,
            })?
        } else {
            Self::new(fallback)?
        };

        let mut dropped = 0usize;
        for (key, raw) in snap.weights {
            match raw.as_f64().filter(|v| v.is_finite()) {
                Some(v) => {
                    store.weights.insert(key, v.clamp(store.min_weight, store.max_weight));
                }
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log(
                Level::Warn,
                Domain::Persist,
                "weights_entries_dropped",
                obj(&[("dropped", serde_json::json!(dropped))]),
            );
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, &self.to_snapshot())
    }

    /// Load from disk, falling back to an empty store on a missing or malformed file.
    pub fn load(path: &Path, cfg: &WeightConfig) -> Result<Self> {
        match read_json::<WeightSnapshot>(path) {
            Ok(Some(snap)) => Self::from_snapshot(snap, cfg),
            Ok(None) => Self::new(cfg),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Persist,
                    "weights_load_failed",
                    obj(&[("path", v_str(&path.display().to_string())), ("msg", v_str(&err.to_string()))]),
                );
                Self::new(cfg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn store() -> WeightStore {
        WeightStore::new(&WeightConfig::default()).unwrap()
    }

    #[test]
    fn absent_key_reads_default() {
        let s = store();
        assert_eq!(s.get("TREND", None), 1.0);
        assert_eq!(s.get("TREND", Some("trending")), 1.0);
    }

    #[test]
    fn regime_keys_are_independent() {
        let mut s = store();
        s.set("TREND", 2.0, Some("trending"));
        assert_eq!(s.get("TREND", Some("trending")), 2.0);
        assert_eq!(s.get("TREND", Some("ranging")), 1.0);
        assert_eq!(s.get("TREND", None), 1.0);
        assert_eq!(weight_key("TREND", Some("trending")), "trending::TREND");
        assert_eq!(weight_key("TREND", None), "TREND");
    }

    #[test]
    fn multiply_and_update_clamp() {
        let mut s = store();
        assert_eq!(s.multiply("MR", 10.0, None), 3.0);
        assert_eq!(s.update("MR", -100.0, None), 0.10);
        assert!((s.multiply("MR", 2.0, None) - 0.20).abs() < 1e-12);
    }

    #[test]
    fn nan_is_ignored() {
        let mut s = store();
        s.set("X", 1.5, None);
        s.set("X", f64::NAN, None);
        assert_eq!(s.get("X", None), 1.5);
        s.multiply("X", f64::INFINITY, None);
        assert_eq!(s.get("X", None), 3.0);
    }

    #[test]
    fn random_operations_stay_in_bounds() {
        let mut s = store();
        let mut rng = StdRng::seed_from_u64(7);
        let variants = ["A", "B", "C"];
        let regimes = [None, Some("trending"), Some("volatile")];
        for _ in 0..2_000 {
            let v = variants[rng.gen_range(0..variants.len())];
            let r = regimes[rng.gen_range(0..regimes.len())];
            match rng.gen_range(0..3) {
                0 => {
                    s.set(v, rng.gen_range(-10.0..10.0), r);
                }
                1 => {
                    s.update(v, rng.gen_range(-5.0..5.0), r);
                }
                _ => {
                    s.multiply(v, rng.gen_range(-3.0..3.0), r);
                }
            }
            let w = s.get(v, r);
            assert!((0.10..=3.00).contains(&w), "weight {} out of bounds", w);
        }
    }

    #[test]
    fn invalid_bounds_rejected() {
        let err = WeightStore::new(&WeightConfig { default_weight: 1.0, min_weight: 2.0, max_weight: 1.0 })
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn snapshot_skips_malformed_entries() {
        let mut weights = BTreeMap::new();
        weights.insert("good".to_string(), Value::from(2.5));
        weights.insert("too_big".to_string(), Value::from(9.0));
        weights.insert("bad".to_string(), Value::from("heavy"));
        let snap = WeightSnapshot { default_weight: 1.0, min_weight: 0.1, max_weight: 3.0, weights };
        let s = WeightStore::from_snapshot(snap, &WeightConfig::default()).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.get("good", None), 2.5);
        assert_eq!(s.get("too_big", None), 3.0);
        assert_eq!(s.get("bad", None), 1.0);
    }

    #[test]
    fn incoherent_snapshot_bounds_fall_back() {
        let snap = WeightSnapshot { default_weight: 1.0, min_weight: 5.0, max_weight: 1.0, weights: BTreeMap::new() };
        let s = WeightStore::from_snapshot(snap, &WeightConfig::default()).unwrap();
        assert_eq!(s.bounds(), (0.10, 3.00));
    }
}
