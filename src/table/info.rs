//! Column statistics persisted with blocks and tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::record::{FieldId, FieldType};

/// A new extreme this many standard deviations from the mean is ignored
/// when outlier rejection is on.
pub const STD_CUTOFF: f64 = 1000.0;

/// Values seen before outlier rejection kicks in.
pub const MIN_CUTOFF: i64 = 5;

/// String frequencies kept per column after pruning.
pub const TOP_STRING_COUNT: usize = 20;

/// Running integer statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntInfo {
    pub min: i64,
    pub max: i64,
    pub avg: f64,
    pub m2: f64,
    pub count: i64,
}

impl IntInfo {
    pub fn new(value: i64) -> Self {
        Self {
            min: value,
            max: value,
            avg: value as f64,
            m2: 0.0,
            count: 1,
        }
    }

    /// Exact update.
    pub fn update(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
        let delta = value as f64 - self.avg;
        self.avg += delta / self.count as f64;
        self.m2 += delta * (value as f64 - self.avg);
    }

    /// Update that refuses to stretch min/max to a value that sits far
    /// outside what has been seen so far. Rejected values do not move the
    /// mean either.
    pub fn update_skipping_outliers(&mut self, value: i64) {
        let delta = value as f64 - self.avg;
        let mut stddev = if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        };
        if stddev <= 1.0 {
            // early on, assume a wide spread
            stddev = self.avg.max(1.0);
        }

        let distance = delta.abs() / stddev;
        let accept = distance < STD_CUTOFF && self.count > MIN_CUTOFF;
        let mut ignored = false;

        if value > self.max {
            if accept {
                self.max = value;
            } else {
                ignored = true;
            }
        }
        if value < self.min {
            if accept {
                self.min = value;
            } else {
                ignored = true;
            }
        }

        if ignored && self.count > MIN_CUTOFF {
            debug!(value, avg = self.avg, distance, "ignoring outlier");
        }

        self.count += 1;
        if !ignored || self.count <= MIN_CUTOFF {
            self.avg += delta / self.count as f64;
            self.m2 += delta * (value as f64 - self.avg);
        }
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }
}

/// Fold one value into table-wide integer stats.
pub fn fold_int(stats: &mut BTreeMap<FieldId, IntInfo>, field: FieldId, value: i64, skip_outliers: bool) {
    match stats.get_mut(&field) {
        Some(info) if skip_outliers => info.update_skipping_outliers(value),
        Some(info) => info.update(value),
        None => {
            stats.insert(field, IntInfo::new(value));
        }
    }
}

/// Value frequencies for one string column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrInfo {
    pub top_counts: BTreeMap<String, i64>,
    pub cardinality: usize,
}

impl StrInfo {
    pub fn update(&mut self, value: &str, increment: i64) {
        match self.top_counts.get_mut(value) {
            Some(count) => *count += increment,
            None => {
                self.top_counts.insert(value.to_string(), increment);
            }
        }
    }

    /// Record the cardinality and keep only the most frequent values.
    pub fn prune(&mut self) {
        self.cardinality = self.cardinality.max(self.top_counts.len());
        if self.top_counts.len() <= TOP_STRING_COUNT {
            return;
        }

        let mut by_count: Vec<(String, i64)> = std::mem::take(&mut self.top_counts)
            .into_iter()
            .collect();
        by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        self.top_counts = by_count.into_iter().take(TOP_STRING_COUNT).collect();
    }
}

/// Per-block statistics stored in the block's `info.db`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedColumnInfo {
    pub num_records: usize,
    pub int_info: BTreeMap<String, IntInfo>,
    pub str_info: BTreeMap<String, StrInfo>,
}

impl SavedColumnInfo {
    pub fn update_int(&mut self, name: &str, value: i64) {
        match self.int_info.get_mut(name) {
            Some(info) => info.update(value),
            None => {
                self.int_info.insert(name.to_string(), IntInfo::new(value));
            }
        }
    }

    pub fn update_str(&mut self, name: &str, value: &str, increment: i64) {
        match self.str_info.get_mut(name) {
            Some(info) => info.update(value, increment),
            None => {
                let mut info = StrInfo::default();
                info.update(value, increment);
                self.str_info.insert(name.to_string(), info);
            }
        }
    }

}

/// Table metadata stored in `<table>/info.db`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub key_table: BTreeMap<String, FieldId>,
    pub key_types: BTreeMap<FieldId, FieldType>,
    pub int_info: BTreeMap<FieldId, IntInfo>,
    pub str_info: BTreeMap<FieldId, StrInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_info_welford() {
        let mut info = IntInfo::new(2);
        for v in [4, 4, 4, 5, 5, 7, 9] {
            info.update(v);
        }
        assert_eq!(info.count, 8);
        assert_eq!(info.min, 2);
        assert_eq!(info.max, 9);
        assert!((info.avg - 5.0).abs() < 1e-12);
        assert!((info.std_dev() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_skip_outliers() {
        let mut info = IntInfo::new(10);
        for v in [11, 12, 10, 11, 12, 10, 11, 12] {
            info.update_skipping_outliers(v);
        }
        let max = info.max;
        assert!(max <= 12);
        info.update_skipping_outliers(1_000_000_000);
        assert_eq!(info.max, max, "Extreme outlier must not stretch max");
        assert!(info.avg < 20.0, "Rejected value must not move the mean");

        info.update_skipping_outliers(15);
        assert_eq!(info.max, 15);
    }

    #[test]
    fn test_early_values_always_counted() {
        // Under MIN_CUTOFF the range is not extended but the mean still moves
        let mut info = IntInfo::new(1);
        info.update_skipping_outliers(100);
        assert_eq!(info.max, 1);
        assert_eq!(info.count, 2);
        assert!(info.avg > 1.0);
    }

    #[test]
    fn test_fold_int_creates_and_updates() {
        let mut stats = BTreeMap::new();
        fold_int(&mut stats, 3, 7, false);
        fold_int(&mut stats, 3, -2, false);
        fold_int(&mut stats, 4, 1, true);
        assert_eq!((stats[&3].min, stats[&3].max, stats[&3].count), (-2, 7, 2));
        assert_eq!(stats[&4].count, 1);
    }

    #[test]
    fn test_str_info_prune() {
        let mut info = StrInfo::default();
        for id in 0..30 {
            info.update(&format!("v{}", id), id as i64 + 1);
        }
        info.prune();

        assert_eq!(info.cardinality, 30);
        assert_eq!(info.top_counts.len(), TOP_STRING_COUNT);
        assert!(info.top_counts.contains_key("v29"), "Most frequent kept");
        assert!(!info.top_counts.contains_key("v0"), "Least frequent dropped");
    }
}
