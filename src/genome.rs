//! Strategy parameter schema, sampling, clamping and mutation.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{AdaptError, Result};

pub const ENTRY_THRESHOLD: &str = "entry_threshold";
pub const STOP_LOSS: &str = "stop_loss";
pub const TAKE_PROFIT: &str = "take_profit";
pub const MAX_HOLD_BARS: &str = "max_hold_bars";
pub const POSITION_SIZE: &str = "position_size";
pub const TREND_FILTER: &str = "trend_filter";
pub const VOL_FILTER: &str = "vol_filter";

/// Share of a field's range used as the mutation standard deviation.
const MUTATION_SIGMA: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Range { lo: f64, hi: f64 },
    Flag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn range(name: &str, lo: f64, hi: f64) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Range { lo, hi } }
    }

    pub fn flag(name: &str) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Flag }
    }

    fn project(&self, v: f64) -> f64 {
        match self.kind {
            FieldKind::Range { lo, hi } => {
                if v.is_nan() {
                    (lo + hi) / 2.0
                } else {
                    v.clamp(lo, hi)
                }
            }
            FieldKind::Flag => {
                if v >= 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Named parameter values. Flags are stored as 0.0 / 1.0.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyGenome {
    values: BTreeMap<String, f64>,
}

impl StrategyGenome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).filter(|v| v.is_finite()).unwrap_or(default)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map(|v| v >= 0.5).unwrap_or(false)
    }

    pub fn set(&mut self, name: &str, v: f64) {
        self.values.insert(name.to_string(), v);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, f64)> for StrategyGenome {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self { values: iter.into_iter().collect() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenomeSchema {
    fields: Vec<FieldSpec>,
}

/// Standard normal sample (Box-Muller).
fn sample_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

impl GenomeSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for f in &fields {
            if !seen.insert(f.name.as_str()) {
                return Err(AdaptError::Configuration(format!("duplicate genome field {}", f.name)));
            }
            if let FieldKind::Range { lo, hi } = f.kind {
                if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                    return Err(AdaptError::Configuration(format!(
                        "genome field {} has invalid range [{}, {}]",
                        f.name, lo, hi
                    )));
                }
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Range midpoints, flags off.
    pub fn default_genome(&self) -> StrategyGenome {
        self.fields
            .iter()
            .map(|f| {
                let v = match f.kind {
                    FieldKind::Range { lo, hi } => (lo + hi) / 2.0,
                    FieldKind::Flag => 0.0,
                };
                (f.name.clone(), v)
            })
            .collect()
    }

    /// Project every schema field present in `genome` into its range.
    /// Fields unknown to the schema pass through untouched.
    pub fn clamp(&self, genome: &StrategyGenome) -> StrategyGenome {
        let mut out = genome.clone();
        for f in &self.fields {
            if let Some(v) = genome.get(&f.name) {
                out.set(&f.name, f.project(v));
            }
        }
        out
    }

    pub fn random_genome<R: Rng + ?Sized>(&self, rng: &mut R) -> StrategyGenome {
        let mut g = StrategyGenome::new();
        for f in &self.fields {
            let v = match f.kind {
                FieldKind::Range { lo, hi } => {
                    if hi > lo {
                        rng.gen_range(lo..=hi)
                    } else {
                        lo
                    }
                }
                FieldKind::Flag => {
                    if rng.gen_bool(0.5) {
                        1.0
                    } else {
                        0.0
                    }
                }
            };
            g.set(&f.name, v);
        }
        self.clamp(&g)
    }

    /// Perturb each present schema field with probability `rate`.
    ///
    /// One coin is drawn per schema field regardless of presence so that the
    /// RNG stream does not depend on which fields a genome carries.
    pub fn mutate<R: Rng + ?Sized>(&self, genome: &StrategyGenome, rate: f64, rng: &mut R) -> StrategyGenome {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        let mut out = genome.clone();
        for f in &self.fields {
            let hit = rng.gen::<f64>() < rate;
            let Some(cur) = genome.get(&f.name) else {
                continue;
            };
            if !hit {
                continue;
            }
            let next = match f.kind {
                FieldKind::Range { lo, hi } => cur + sample_normal(rng) * MUTATION_SIGMA * (hi - lo),
                FieldKind::Flag => {
                    if cur >= 0.5 {
                        0.0
                    } else {
                        1.0
                    }
                }
            };
            out.set(&f.name, next);
        }
        self.clamp(&out)
    }

    /// True when every schema field present in `genome` is inside its range.
    pub fn contains(&self, genome: &StrategyGenome) -> bool {
        self.fields.iter().all(|f| match (genome.get(&f.name), f.kind) {
            (None, _) => true,
            (Some(v), FieldKind::Range { lo, hi }) => v >= lo && v <= hi,
            (Some(v), FieldKind::Flag) => v == 0.0 || v == 1.0,
        })
    }
}

impl Default for GenomeSchema {
    fn default() -> Self {
        Self {
            fields: vec![
                FieldSpec::range(ENTRY_THRESHOLD, 0.10, 0.90),
                FieldSpec::range(STOP_LOSS, 0.002, 0.05),
                FieldSpec::range(TAKE_PROFIT, 0.002, 0.10),
                FieldSpec::range(MAX_HOLD_BARS, 2.0, 96.0),
                FieldSpec::range(POSITION_SIZE, 0.001, 0.05),
                FieldSpec::flag(TREND_FILTER),
                FieldSpec::flag(VOL_FILTER),
            ],
        }
    }
}

/// Risk parameters handed to execution alongside an allowed decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub stop_loss: f64,
    pub take_profit: f64,
    pub max_hold_bars: u32,
    pub position_size: f64,
}

impl RiskConfig {
    pub fn from_genome(genome: &StrategyGenome) -> Self {
        Self {
            stop_loss: genome.get_or(STOP_LOSS, 0.01),
            take_profit: genome.get_or(TAKE_PROFIT, 0.02),
            max_hold_bars: genome.get_or(MAX_HOLD_BARS, 24.0).round().max(1.0) as u32,
            position_size: genome.get_or(POSITION_SIZE, 0.01),
        }
    }
}
