//! Outcome aggregation and fitness scoring.
//!
//! Outcomes are bucketed by the canonical feature fingerprint and also kept
//! as a bounded chronological trail. `FitnessEvaluator` folds stats into one
//! scalar; the `GenomeEvaluator` implementations decide which stats a genome
//! is judged on.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::genome::{StrategyGenome, ENTRY_THRESHOLD, POSITION_SIZE, STOP_LOSS, TAKE_PROFIT, TREND_FILTER};
use crate::learner::OutcomeRecord;
use crate::regime::Regime;

pub const TRAIL_CAPACITY: usize = 2000;

/// Position size the trail's per-unit pnl is expressed against.
pub const REFERENCE_SIZE: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub samples: u64,
    pub wins: u64,
    pub losses: u64,
    pub total_pnl: f64,
    pub max_loss_streak: u64,
    /// Current run of consecutive losses.
    #[serde(default)]
    pub loss_streak: u64,
    /// Built from records in arrival order, so the streak figures are meaningful.
    #[serde(default)]
    pub ordered: bool,
}

impl OutcomeStats {
    /// Counts without ordering; drawdown falls back to the loss rate.
    pub fn from_counts(wins: u64, losses: u64, total_pnl: f64) -> Self {
        Self { samples: wins + losses, wins, losses, total_pnl, ..Self::default() }
    }

    pub fn push(&mut self, pnl: f64, win: bool) {
        self.samples += 1;
        if pnl.is_finite() {
            self.total_pnl += pnl;
        }
        if win {
            self.wins += 1;
            self.loss_streak = 0;
        } else {
            self.losses += 1;
            self.loss_streak += 1;
            self.max_loss_streak = self.max_loss_streak.max(self.loss_streak);
        }
        self.ordered = true;
    }

    pub fn avg_pnl(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total_pnl / self.samples as f64
        }
    }

    pub fn win_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided == 0 {
            0.0
        } else {
            self.wins as f64 / decided as f64
        }
    }

    pub fn loss_rate(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.losses as f64 / self.samples as f64
        }
    }

    pub fn drawdown(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else if self.ordered {
            self.max_loss_streak as f64 / self.samples as f64
        } else {
            self.loss_rate()
        }
    }
}

/// One closed trade as kept in the chronological trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSample {
    pub fingerprint: String,
    pub pnl: f64,
    pub win: bool,
    pub score: f64,
    pub variant: String,
    pub regime: String,
}

pub trait OutcomeAggregator {
    fn record(&mut self, snapshot: &str, outcome: &OutcomeRecord);

    fn get_stats(&self, snapshot: &str) -> OutcomeStats;

    /// Stats across every snapshot.
    fn overall(&self) -> OutcomeStats;

    /// Oldest first.
    fn trail(&self) -> Vec<TradeSample>;

    /// Stats over the most recent `n` trail entries.
    fn recent(&self, n: usize) -> OutcomeStats {
        let trail = self.trail();
        let skip = trail.len().saturating_sub(n);
        let mut stats = OutcomeStats::default();
        for s in &trail[skip..] {
            stats.push(s.pnl, s.win);
        }
        stats
    }
}

#[derive(Debug, Clone)]
pub struct MemoryAggregator {
    by_snapshot: HashMap<String, OutcomeStats>,
    overall: OutcomeStats,
    trail: VecDeque<TradeSample>,
    capacity: usize,
}

impl Default for MemoryAggregator {
    fn default() -> Self {
        Self::with_capacity(TRAIL_CAPACITY)
    }
}

impl MemoryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            by_snapshot: HashMap::new(),
            overall: OutcomeStats::default(),
            trail: VecDeque::with_capacity(capacity.min(TRAIL_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn snapshots(&self) -> usize {
        self.by_snapshot.len()
    }
}

impl OutcomeAggregator for MemoryAggregator {
    fn record(&mut self, snapshot: &str, outcome: &OutcomeRecord) {
        self.by_snapshot
            .entry(snapshot.to_string())
            .or_default()
            .push(outcome.pnl, outcome.win);
        self.overall.push(outcome.pnl, outcome.win);

        if self.trail.len() == self.capacity {
            self.trail.pop_front();
        }
        self.trail.push_back(TradeSample {
            fingerprint: snapshot.to_string(),
            pnl: outcome.pnl,
            win: outcome.win,
            score: outcome.score,
            variant: outcome.variant_or_unknown().to_string(),
            regime: outcome.regime_or_unknown().to_string(),
        });
    }

    fn get_stats(&self, snapshot: &str) -> OutcomeStats {
        self.by_snapshot.get(snapshot).copied().unwrap_or_default()
    }

    fn overall(&self) -> OutcomeStats {
        self.overall
    }

    fn trail(&self) -> Vec<TradeSample> {
        self.trail.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitnessScore {
    pub avg_pnl: f64,
    pub win_rate: f64,
    pub drawdown: f64,
    pub samples: u64,
    pub value: f64,
}

/// Smallest sample count that scores without a thin-sample penalty.
pub const PENALTY_FREE_SAMPLES: u64 = 30;

/// Penalty that keeps thin samples from winning by chance.
pub fn sample_penalty(samples: u64) -> f64 {
    match samples {
        0 => 1.0,
        1..=9 => 0.5,
        s if s < PENALTY_FREE_SAMPLES => 0.2,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitnessEvaluator {
    pub pnl_weight: f64,
    pub win_rate_weight: f64,
    pub drawdown_weight: f64,
}

impl Default for FitnessEvaluator {
    fn default() -> Self {
        Self { pnl_weight: 1.0, win_rate_weight: 0.2, drawdown_weight: 0.5 }
    }
}

impl FitnessEvaluator {
    pub fn score(&self, stats: &OutcomeStats) -> FitnessScore {
        let avg_pnl = stats.avg_pnl();
        let win_rate = stats.win_rate();
        let drawdown = stats.drawdown();
        let value = avg_pnl * self.pnl_weight + win_rate * self.win_rate_weight
            - drawdown * self.drawdown_weight
            - sample_penalty(stats.samples);
        FitnessScore { avg_pnl, win_rate, drawdown, samples: stats.samples, value }
    }
}

/// Fitness of a candidate genome.
pub trait GenomeEvaluator: Sync {
    fn evaluate(&self, genome: &StrategyGenome) -> Result<f64>;
}

/// Scores every genome against the same aggregate; the genome is ignored.
#[derive(Debug, Clone)]
pub struct HistoricalFitness {
    stats: OutcomeStats,
    evaluator: FitnessEvaluator,
}

impl HistoricalFitness {
    pub fn new(stats: OutcomeStats) -> Self {
        Self { stats, evaluator: FitnessEvaluator::default() }
    }
}

impl GenomeEvaluator for HistoricalFitness {
    fn evaluate(&self, _genome: &StrategyGenome) -> Result<f64> {
        Ok(self.evaluator.score(&self.stats).value)
    }
}

/// Counterfactual replay of the trade trail under a candidate genome.
///
/// Trail pnl is a per-unit return realized at `reference_size`. A trade is
/// replayed only if its entry score clears the genome's `entry_threshold`
/// and, with `trend_filter` on, it was taken in a trending regime. Its
/// return is clipped to `[-stop_loss, take_profit]` and scaled by
/// `position_size / reference_size`.
///
/// [`ReplayFitness::realized`] skips the entry filters: every trade in the
/// trail counts, as it does for a window the genome actually traded.
#[derive(Debug, Clone)]
pub struct ReplayFitness {
    trail: Vec<TradeSample>,
    reference_size: f64,
    filter_entries: bool,
    evaluator: FitnessEvaluator,
}

impl ReplayFitness {
    pub fn new(trail: Vec<TradeSample>) -> Self {
        Self { trail, reference_size: REFERENCE_SIZE, filter_entries: true, evaluator: FitnessEvaluator::default() }
    }

    pub fn realized(trail: Vec<TradeSample>) -> Self {
        Self { filter_entries: false, ..Self::new(trail) }
    }

    pub fn with_reference_size(mut self, size: f64) -> Self {
        if size.is_finite() && size > 0.0 {
            self.reference_size = size;
        }
        self
    }

    pub fn replay(&self, genome: &StrategyGenome) -> OutcomeStats {
        let entry = genome.get_or(ENTRY_THRESHOLD, 0.0);
        let stop = genome.get_or(STOP_LOSS, f64::INFINITY).abs();
        let take = genome.get_or(TAKE_PROFIT, f64::INFINITY).abs();
        let scale = genome.get_or(POSITION_SIZE, self.reference_size) / self.reference_size;
        let trending_only = genome.flag(TREND_FILTER);

        let mut stats = OutcomeStats { ordered: true, ..OutcomeStats::default() };
        for s in &self.trail {
            if self.filter_entries && s.score < entry {
                continue;
            }
            if self.filter_entries && trending_only && s.regime != Regime::Trending.as_str() {
                continue;
            }
            let pnl = if s.pnl.is_finite() { s.pnl.clamp(-stop, take) * scale } else { 0.0 };
            stats.push(pnl, pnl > 0.0);
        }
        stats
    }
}

impl GenomeEvaluator for ReplayFitness {
    fn evaluate(&self, genome: &StrategyGenome) -> Result<f64> {
        Ok(self.evaluator.score(&self.replay(genome)).value)
    }
}
