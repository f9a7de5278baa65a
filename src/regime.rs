//! Coarse market-condition labels used to condition arbitration weights.

use serde::{Deserialize, Serialize};

use crate::features::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::Ranging => "ranging",
            Regime::Volatile => "volatile",
            Regime::Unknown => "unknown",
        }
    }
}

/// Output of a classifier for one candle window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeContext {
    pub regime: Regime,
    /// 0.0 = no idea, 1.0 = certain
    pub confidence: f64,
    /// Signed efficiency ratio of the window (-1..1)
    pub trend_strength: f64,
    /// Recent volatility relative to the whole window
    pub vol_ratio: f64,
}

impl RegimeContext {
    pub fn unknown() -> Self {
        Self { regime: Regime::Unknown, confidence: 0.0, trend_strength: 0.0, vol_ratio: 1.0 }
    }

    pub fn label(&self) -> &'static str {
        self.regime.as_str()
    }
}

impl Default for RegimeContext {
    fn default() -> Self {
        Self::unknown()
    }
}

pub trait RegimeClassifier {
    fn detect(&self, window: &[Candle]) -> RegimeContext;
}

/// Trend / volatility classifier.
///
/// Trend strength is the efficiency ratio `|net move| / sum(|moves|)`.
/// Volatility expansion compares the stddev of returns over the most recent
/// quarter of the window with the stddev over the whole window.
#[derive(Debug, Clone)]
pub struct TrendVolClassifier {
    pub min_window: usize,
    pub trend_efficiency: f64,
    pub vol_expansion: f64,
}

impl TrendVolClassifier {
    pub fn new(min_window: usize) -> Self {
        Self { min_window: min_window.max(4), trend_efficiency: 0.35, vol_expansion: 1.6 }
    }
}

impl Default for TrendVolClassifier {
    fn default() -> Self {
        Self::new(20)
    }
}

fn stddev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
    var.max(0.0).sqrt()
}

impl RegimeClassifier for TrendVolClassifier {
    fn detect(&self, window: &[Candle]) -> RegimeContext {
        if window.len() < self.min_window {
            return RegimeContext::unknown();
        }

        let returns: Vec<f64> = window
            .windows(2)
            .map(|w| if w[0].c > 0.0 { (w[1].c - w[0].c) / w[0].c } else { 0.0 })
            .collect();

        let first = window.first().map(|c| c.c).unwrap_or(0.0);
        let last = window.last().map(|c| c.c).unwrap_or(0.0);
        let path: f64 = window.windows(2).map(|w| (w[1].c - w[0].c).abs()).sum();
        let net = last - first;
        let efficiency = if path > 0.0 { (net.abs() / path).min(1.0) } else { 0.0 };
        let trend_strength = efficiency * net.signum();

        let full_vol = stddev(&returns);
        let recent_len = (returns.len() / 4).max(2).min(returns.len());
        let recent_vol = stddev(&returns[returns.len() - recent_len..]);
        let vol_ratio = if full_vol > 1e-12 { recent_vol / full_vol } else { 1.0 };

        let (regime, confidence) = if vol_ratio >= self.vol_expansion {
            (Regime::Volatile, (0.5 + (vol_ratio - self.vol_expansion)).min(1.0))
        } else if efficiency >= self.trend_efficiency {
            (Regime::Trending, efficiency)
        } else {
            (Regime::Ranging, 1.0 - efficiency / self.trend_efficiency)
        };

        RegimeContext { regime, confidence: confidence.clamp(0.0, 1.0), trend_strength, vol_ratio }
    }
}
