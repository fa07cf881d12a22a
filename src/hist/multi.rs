use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{add_entries, BasicHist, Moments};

/// A stack of [`BasicHist`]s. `subhists[0]` covers the top half of the range,
/// each following one half of what remains, and the last one everything
/// down to the minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHist {
    range_min: i64,
    range_max: i64,
    target_buckets: usize,
    track_percentiles: bool,
    subhists: Vec<BasicHist>,
    moments: Moments,
}

impl MultiHist {
    pub fn new(min: i64, max: i64, target_buckets: usize, track_percentiles: bool) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let mut subhists = Vec::new();

        if track_percentiles {
            let target = target_buckets.max(1) as i128;
            let mut span = max as i128 - min as i128;
            let mut splits = 0;
            let mut remaining = span;
            while remaining > target {
                splits += 1;
                remaining >>= 1;
            }

            let mut right = max as i128;
            for _ in 0..splits {
                span >>= 1;
                let left = right - span;
                subhists.push(BasicHist::new(left as i64, right as i64, target_buckets, true));
                right = left;
            }
            subhists.push(BasicHist::new(min, right as i64, target_buckets, true));
        }

        Self {
            range_min: min,
            range_max: max,
            target_buckets,
            track_percentiles,
            subhists,
            moments: Moments::default(),
        }
    }

    pub fn add(&mut self, value: i64, weight: i64) {
        if weight <= 0 {
            return;
        }
        self.moments.add(value, weight);
        self.route(value, weight);
    }

    /// Find the sub-histogram that owns `value`. Values above the range go to
    /// the top one, values below to the last.
    fn route(&mut self, value: i64, weight: i64) {
        if self.subhists.is_empty() {
            return;
        }
        let idx = if value > self.range_max {
            0
        } else {
            self.subhists
                .iter()
                .position(|sub| sub.contains(value))
                .unwrap_or(self.subhists.len() - 1)
        };
        self.subhists[idx].add(value, weight);
    }

    pub fn moments(&self) -> &Moments {
        &self.moments
    }

    pub fn range(&self) -> (i64, i64) {
        (self.range_min, self.range_max)
    }

    pub fn subhists(&self) -> &[BasicHist] {
        &self.subhists
    }

    pub fn buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for sub in &self.subhists {
            add_entries(&mut out, &sub.buckets());
        }
        out
    }

    pub(crate) fn raw_buckets(&self) -> BTreeMap<i64, i64> {
        let mut out = BTreeMap::new();
        for sub in &self.subhists {
            add_entries(&mut out, &sub.raw_buckets());
        }
        out
    }

    fn same_geometry(&self, other: &MultiHist) -> bool {
        self.range_min == other.range_min
            && self.range_max == other.range_max
            && self.track_percentiles == other.track_percentiles
            && self.subhists.len() == other.subhists.len()
            && self
                .subhists
                .iter()
                .zip(&other.subhists)
                .all(|(a, b)| a.same_geometry(b))
    }

    pub fn combine(&mut self, other: &MultiHist) {
        if self.same_geometry(other) {
            for (sub, theirs) in self.subhists.iter_mut().zip(&other.subhists) {
                sub.combine(theirs);
            }
            self.moments.merge(&other.moments);
            return;
        }

        let (min, max) = other.range();
        self.absorb(min, max, &other.raw_buckets(), &other.moments);
    }

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

        let mut rebuilt = MultiHist::new(
            self.range_min.min(min),
            self.range_max.max(max),
            self.target_buckets,
            true,
        );
        for (value, count) in self.raw_buckets().iter().chain(entries.iter()) {
            rebuilt.route(*value, *count);
        }
        rebuilt.moments = self.moments.clone();
        rebuilt.moments.merge(moments);

        *self = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subhist_layout() {
        let hist = MultiHist::new(0, 1600, 100, true);
        let ranges: Vec<(i64, i64)> = hist.subhists().iter().map(|s| s.range()).collect();

        // 1600 -> 800 -> 400 -> 200 -> 100: four halvings
        assert_eq!(
            ranges,
            vec![(800, 1600), (400, 800), (200, 400), (100, 200), (0, 100)]
        );
    }

    #[test]
    fn test_narrow_range_single_subhist() {
        let hist = MultiHist::new(10, 60, 100, true);
        assert_eq!(hist.subhists().len(), 1);
        assert_eq!(hist.subhists()[0].range(), (10, 60));
    }

    #[test]
    fn test_routing() {
        let mut hist = MultiHist::new(0, 1600, 100, true);
        hist.add(1500, 1);
        hist.add(50, 1);
        hist.add(5000, 1);
        hist.add(-20, 1);

        let subs = hist.subhists();
        assert_eq!(subs[0].moments().count, 2, "Top range and above-max");
        assert_eq!(subs[4].moments().count, 2, "Bottom range and below-min");
        assert_eq!(hist.buckets().values().sum::<i64>(), 4);
        assert_eq!(hist.moments().min, -20);
        assert_eq!(hist.moments().max, 5000);
    }

    #[test]
    fn test_fine_resolution_at_bottom() {
        let mut hist = MultiHist::new(0, 100_000, 100, true);
        hist.add(3, 1);
        hist.add(4, 1);
        let keys: Vec<i64> = hist.buckets().keys().copied().collect();
        assert_eq!(keys, vec![3, 4], "Lowest slice has one value per bucket");
    }

    #[test]
    fn test_rebuild_on_range_mismatch() {
        let mut a = MultiHist::new(0, 1000, 100, true);
        let mut b = MultiHist::new(0, 5000, 100, true);
        a.add(999, 2);
        b.add(4000, 3);

        a.combine(&b);
        assert_eq!(a.range(), (0, 5000));
        assert_eq!(a.moments().count, 5);
        assert_eq!(a.buckets().values().sum::<i64>(), 5);
    }
}
