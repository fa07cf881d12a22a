use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{add_entries, Moments};

/// Linear bucket histogram over `[range_min, range_max]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicHist {
    range_min: i64,
    range_max: i64,
    bucket_size: i64,
    /// Requested bucket count, kept so rebuilt histograms size the same way.
    target_buckets: usize,
    track_percentiles: bool,
    counts: Vec<i64>,
    outliers: BTreeMap<i64, i64>,
    underliers: BTreeMap<i64, i64>,
    moments: Moments,
}

/// Bucket width and bucket count for a range. Narrow ranges get one bucket
/// per value, wide ranges never get more than 100 values per bucket short of
/// the target count.
fn geometry(min: i64, max: i64, target_buckets: usize) -> (i64, usize) {
    let size = (max as i128 - min as i128).clamp(0, i64::MAX as i128) as i64;
    let mut buckets = target_buckets.max(1) as i64;
    let mut bucket_size = size / buckets;

    if bucket_size == 0 {
        if size < 100 {
            bucket_size = 1;
            buckets = size;
        } else {
            bucket_size = size / 100;
            buckets = size / bucket_size;
        }
    }

    (bucket_size, (buckets + 1) as usize)
}

impl BasicHist {
    pub fn new(min: i64, max: i64, target_buckets: usize, track_percentiles: bool) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let (bucket_size, buckets) = geometry(min, max, target_buckets);
        let counts = if track_percentiles {
            vec![0; buckets + 1]
        } else {
            Vec::new()
        };

        Self {
            range_min: min,
            range_max: max,
            bucket_size,
            target_buckets,
            track_percentiles,
            counts,
            outliers: BTreeMap::new(),
            underliers: BTreeMap::new(),
            moments: Moments::default(),
        }
    }

    pub fn add(&mut self, value: i64, weight: i64) {
        if weight <= 0 {
            return;
        }
        self.moments.add(value, weight);
        if self.track_percentiles {
            self.insert(value, weight);
        }
    }

    /// Count `weight` into the bucket holding `value` without touching the
    /// moments.
    fn insert(&mut self, value: i64, weight: i64) {
        if value < self.range_min {
            *self.underliers.entry(value).or_insert(0) += weight;
            return;
        }

        let idx = (value as i128 - self.range_min as i128) / self.bucket_size as i128;
        if idx < self.counts.len() as i128 {
            self.counts[idx as usize] += weight;
        } else {
            *self.outliers.entry(value).or_insert(0) += weight;
        }
    }

    pub fn moments(&self) -> &Moments {
        &self.moments
    }

    pub fn range(&self) -> (i64, i64) {
        (self.range_min, self.range_max)
    }

    pub fn bucket_size(&self) -> i64 {
        self.bucket_size
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.range_min && value <= self.range_max
    }

    fn bucket_start(&self, idx: usize) -> i64 {
        (self.range_min as i128 + idx as i128 * self.bucket_size as i128)
            .clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Non-empty buckets keyed by bucket start clamped into the observed
    /// `[min, max]`, plus exact outliers and underliers.
    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        if self.moments.count == 0 {
            return out;
        }
        let (lo, hi) = (self.moments.min, self.moments.max);
        for (idx, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                *out.entry(self.bucket_start(idx).clamp(lo, hi)).or_insert(0) += count;
            }
        }
        add_entries(&mut out, &self.outliers);
        add_entries(&mut out, &self.underliers);
        out
    }

    /// Non-empty buckets keyed by unclamped bucket start. Used when
    /// re-inserting into a histogram with different geometry.
    pub(crate) fn raw_buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for (idx, count) in self.counts.iter().enumerate() {
            if *count > 0 {
                *out.entry(self.bucket_start(idx)).or_insert(0) += count;
            }
        }
        add_entries(&mut out, &self.outliers);
        add_entries(&mut out, &self.underliers);
        out
    }

    pub(crate) fn same_geometry(&self, other: &BasicHist) -> bool {
        self.range_min == other.range_min
            && self.bucket_size == other.bucket_size
            && self.counts.len() == other.counts.len()
            && self.track_percentiles == other.track_percentiles
    }

    pub fn combine(&mut self, other: &BasicHist) {
        if self.same_geometry(other) {
            for (slot, count) in self.counts.iter_mut().zip(&other.counts) {
                *slot += count;
            }
            add_entries(&mut self.outliers, &other.outliers);
            add_entries(&mut self.underliers, &other.underliers);
            self.moments.merge(&other.moments);
            return;
        }

        let (min, max) = other.range();
        self.absorb(min, max, &other.raw_buckets(), &other.moments);
    }

    /// Rebuild over the union of our range and `[min, max]`, then re-insert
    /// our buckets and `entries`.
    pub(crate) fn absorb(
        &mut self,
        min: i64,
        max: i64,
        entries: &BTreeMap<i64, i64>,
        moments: &Moments,
    ) {
        if !self.track_percentiles {
            self.moments.merge(moments);
            return;
        }

        let mut rebuilt = BasicHist::new(
            self.range_min.min(min),
            self.range_max.max(max),
            self.target_buckets,
            true,
        );
        for (value, count) in self.raw_buckets().iter().chain(entries.iter()) {
            rebuilt.insert(*value, *count);
        }
        rebuilt.moments = self.moments.clone();
        rebuilt.moments.merge(moments);

        *self = rebuilt;
    }
}
