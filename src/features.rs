use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: u64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

/// Named feature values. Ordered so that iteration and fingerprints are stable.
pub type FeatureSet = BTreeMap<String, f64>;

pub const MOMENTUM: &str = "momentum";
pub const Z_MOMENTUM: &str = "z_momentum";
pub const VOL: &str = "vol";
pub const VOL_RATIO: &str = "vol_ratio";
pub const STRETCH: &str = "stretch";
pub const VOLUME_SPIKE: &str = "volume_spike";

/// Read a feature, treating missing or non-finite values as 0.
pub fn feature(features: &FeatureSet, name: &str) -> f64 {
    features.get(name).copied().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Canonical key for a feature snapshot.
///
/// Keys are visited in sorted order and values quantized to 4 decimals, so
/// snapshots that differ only by float noise share a key.
pub fn fingerprint(features: &FeatureSet) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in features {
        let val = if v.is_finite() {
            format!("{:.4}", v)
        } else {
            "nan".to_string()
        };
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(val.as_bytes());
        hasher.update(b";");
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone)]
pub struct RollingStats {
    window: usize,
    buf: VecDeque<f64>,
    sum: f64,
    sumsq: f64,
}

impl RollingStats {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), buf: VecDeque::new(), sum: 0.0, sumsq: 0.0 }
    }

    pub fn push(&mut self, x: f64) {
        self.buf.push_back(x);
        self.sum += x;
        self.sumsq += x * x;
        if self.buf.len() > self.window {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old;
                self.sumsq -= old * old;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() { 0.0 } else { self.sum / self.buf.len() as f64 }
    }

    pub fn variance(&self) -> f64 {
        let n = self.buf.len() as f64;
        if n < 2.0 { 0.0 } else { ((self.sumsq - (self.sum * self.sum) / n) / (n - 1.0)).max(0.0) }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Rolling feature computation over a candle stream.
pub struct FeaturePipeline {
    closes: VecDeque<f64>,
    window: usize,
    momentum_len: usize,
    price: RollingStats,
    returns_long: RollingStats,
    returns_short: RollingStats,
    volume: RollingStats,
}

impl FeaturePipeline {
    pub fn new(window: usize) -> Self {
        let window = window.max(4);
        let short = (window / 5).max(2);
        Self {
            closes: VecDeque::with_capacity(window + 1),
            window,
            momentum_len: short,
            price: RollingStats::new(window),
            returns_long: RollingStats::new(window),
            returns_short: RollingStats::new(short),
            volume: RollingStats::new(window),
        }
    }

    pub fn update(&mut self, candle: &Candle) -> FeatureSet {
        let prev = self.closes.back().copied();
        self.closes.push_back(candle.c);
        if self.closes.len() > self.window + 1 {
            self.closes.pop_front();
        }

        let ret = match prev {
            Some(p) if p > 0.0 => (candle.c - p) / p,
            _ => 0.0,
        };
        if prev.is_some() {
            self.returns_long.push(ret);
            self.returns_short.push(ret);
        }
        self.price.push(candle.c);

        let lookback = self.momentum_len.min(self.closes.len().saturating_sub(1));
        let momentum = if lookback > 0 {
            let base = self.closes[self.closes.len() - 1 - lookback];
            if base > 0.0 { (candle.c - base) / base } else { 0.0 }
        } else {
            0.0
        };

        let vol = self.returns_long.stddev();
        let z_momentum = if vol > 1e-12 && lookback > 0 {
            momentum / (vol * (lookback as f64).sqrt())
        } else {
            0.0
        };
        let vol_ratio = if vol > 1e-12 { self.returns_short.stddev() / vol } else { 1.0 };
        let price_std = self.price.stddev();
        let stretch = if price_std > 1e-12 { (candle.c - self.price.mean()) / price_std } else { 0.0 };

        let vol_mean = self.volume.mean();
        let volume_spike = if vol_mean > 0.0 { candle.v / vol_mean } else { 1.0 };
        self.volume.push(candle.v);

        let mut out = FeatureSet::new();
        out.insert(MOMENTUM.to_string(), momentum);
        out.insert(Z_MOMENTUM.to_string(), z_momentum.clamp(-10.0, 10.0));
        out.insert(VOL.to_string(), vol);
        out.insert(VOL_RATIO.to_string(), vol_ratio);
        out.insert(STRETCH.to_string(), stretch.clamp(-10.0, 10.0));
        out.insert(VOLUME_SPIKE.to_string(), volume_spike);
        out
    }
}
