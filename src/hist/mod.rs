//! Histograms for integer aggregations.
//!
//! Two implementations share one contract through [`Histogram`]:
//!
//! - [`BasicHist`]: linear buckets over the column's `[min, max]`. Values that
//!   fall outside the range are kept exactly as outliers/underliers.
//! - [`MultiHist`]: a stack of basic histograms. Starting at the maximum, the
//!   range is halved repeatedly until the remaining slice is narrower than
//!   the bucket count; the last histogram covers everything below.
//!
//! Mean, standard deviation, min and max are tracked exactly with running
//! moments, so they never depend on bucket geometry. Percentiles and the
//! sparse bucket map come from the buckets.
//!
//! Two histograms with identical geometry merge by adding bucket counts.
//! Anything else falls back to rebuilding a histogram over the union of both
//! ranges and re-inserting every bucket's representative value.

pub mod basic;
pub mod multi;

pub use basic::BasicHist;
pub use multi::MultiHist;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of entries in a percentile array (p0 through p99).
pub const NUM_PERCENTILES: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistKind {
    #[default]
    Basic,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistParams {
    pub kind: HistKind,
    pub num_buckets: usize,
    /// Without percentile tracking only the moments are kept.
    pub track_percentiles: bool,
}

impl HistParams {
    pub fn new(kind: HistKind, num_buckets: usize, track_percentiles: bool) -> Self {
        Self {
            kind,
            num_buckets,
            track_percentiles,
        }
    }
}

/// Exact running statistics, merged with the parallel variance formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    /// Total weight
    pub count: i64,
    /// Raw insertions
    pub samples: i64,
    pub min: i64,
    pub max: i64,
    mean: f64,
    m2: f64,
}

impl Default for Moments {
    fn default() -> Self {
        Self {
            count: 0,
            samples: 0,
            min: i64::MAX,
            max: i64::MIN,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl Moments {
    pub fn add(&mut self, value: i64, weight: i64) {
        if weight <= 0 {
            return;
        }
        self.samples += 1;
        self.count += weight;

        let x = value as f64;
        let w = weight as f64;
        let delta = x - self.mean;
        self.mean += delta * w / self.count as f64;
        self.m2 += w * delta * (x - self.mean);

        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &Moments) {
        if other.count == 0 {
            self.samples += other.samples;
            return;
        }
        if self.count == 0 {
            let samples = self.samples;
            *self = other.clone();
            self.samples += samples;
            return;
        }

        let na = self.count as f64;
        let nb = other.count as f64;
        let n = na + nb;
        let delta = other.mean - self.mean;

        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.count += other.count;
        self.samples += other.samples;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }
}

/// Walk ascending `(value, count)` entries and pick the value where each
/// percentile threshold is crossed. p0 is the observed min and p99 the
/// observed max.
pub(crate) fn percentiles(entries: &BTreeMap<i64, i64>, moments: &Moments) -> Vec<i64> {
    let total: i64 = entries.values().sum();
    if moments.count == 0 || total == 0 {
        return Vec::new();
    }

    let sorted: Vec<(i64, i64)> = entries.iter().map(|(v, c)| (*v, *c)).collect();
    let mut out = vec![0i64; NUM_PERCENTILES];
    out[0] = moments.min;
    out[NUM_PERCENTILES - 1] = moments.max;

    let mut idx = 0;
    let mut cumulative = sorted[0].1;
    for (p, slot) in out
        .iter_mut()
        .enumerate()
        .take(NUM_PERCENTILES - 1)
        .skip(1)
    {
        let threshold = ((total as i128 * p as i128 + 99) / 100).max(1) as i64;
        while cumulative < threshold && idx + 1 < sorted.len() {
            idx += 1;
            cumulative += sorted[idx].1;
        }
        *slot = sorted[idx].0.clamp(moments.min, moments.max);
    }

    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Histogram {
    Basic(BasicHist),
    Multi(MultiHist),
}

impl Histogram {
    /// Build a histogram sized for values in `[min, max]`.
    pub fn new(params: &HistParams, min: i64, max: i64) -> Self {
        match params.kind {
            HistKind::Basic => Histogram::Basic(BasicHist::new(
                min,
                max,
                params.num_buckets,
                params.track_percentiles,
            )),
            HistKind::Multi => Histogram::Multi(MultiHist::new(
                min,
                max,
                params.num_buckets,
                params.track_percentiles,
            )),
        }
    }

    pub fn add(&mut self, value: i64, weight: i64) {
        match self {
            Histogram::Basic(h) => h.add(value, weight),
            Histogram::Multi(h) => h.add(value, weight),
        }
    }

    pub fn moments(&self) -> &Moments {
        match self {
            Histogram::Basic(h) => h.moments(),
            Histogram::Multi(h) => h.moments(),
        }
    }

    pub fn mean(&self) -> f64 {
        self.moments().mean()
    }

    pub fn std_dev(&self) -> f64 {
        self.moments().std_dev()
    }

    pub fn min(&self) -> i64 {
        self.moments().min
    }

    pub fn max(&self) -> i64 {
        self.moments().max
    }

    /// Total weighted count.
    pub fn count(&self) -> i64 {
        self.moments().count
    }

    pub fn samples(&self) -> i64 {
        self.moments().samples
    }

    /// The value range this histogram was sized for.
    pub fn range(&self) -> (i64, i64) {
        match self {
            Histogram::Basic(h) => h.range(),
            Histogram::Multi(h) => h.range(),
        }
    }

    /// p0 through p99. Empty when nothing was recorded or percentiles are
    /// not tracked.
    pub fn percentiles(&self) -> Vec<i64> {
        percentiles(&self.buckets(), self.moments())
    }

    /// Non-empty buckets keyed by their representative value.
    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        match self {
            Histogram::Basic(h) => h.buckets(),
            Histogram::Multi(h) => h.buckets(),
        }
    }

    /// Merge `other` into `self`. Mismatched kinds merge through the
    /// re-insertion path of `self`'s kind.
    pub fn combine(&mut self, other: &Histogram) {
        match (self, other) {
            (Histogram::Basic(a), Histogram::Basic(b)) => a.combine(b),
            (Histogram::Multi(a), Histogram::Multi(b)) => a.combine(b),
            (Histogram::Basic(a), other) => {
                let (min, max) = other.range();
                a.absorb(min, max, &other.raw_buckets(), other.moments())
            }
            (Histogram::Multi(a), other) => {
                let (min, max) = other.range();
                a.absorb(min, max, &other.raw_buckets(), other.moments())
            }
        }
    }

    fn raw_buckets(&self) -> BTreeMap<i64, i64> {
        match self {
            Histogram::Basic(h) => h.raw_buckets(),
            Histogram::Multi(h) => h.raw_buckets(),
        }
    }
}

pub(crate) fn add_entries(into: &mut BTreeMap<i64, i64>, from: &BTreeMap<i64, i64>) {
    for (value, count) in from {
        *into.entry(*value).or_insert(0) += count;
    }
}
