use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::hist::{HistKind, Histogram};
use crate::query::distinct::HyperLogLog;
use crate::query::filter::{Filter, StrOp};
use crate::record::{FieldId, FieldType, Row};
use crate::table::info::SavedColumnInfo;

pub const DEFAULT_LIMIT: usize = 100;

/// Display key of the single group in an ungrouped query.
pub const TOTAL_KEY: &str = "total";

/// Joins group tuple segments.
pub const GROUP_DELIMITER: &str = "\t";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggOp {
    Avg,
    Hist,
    Distinct,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregation {
    pub name: String,
    pub field: FieldId,
    pub ty: FieldType,
    pub op: AggOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grouping {
    pub name: String,
    pub field: FieldId,
    pub ty: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub name: String,
    pub field: FieldId,
    /// Bucket width in the time column's units
    pub width: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightColumn {
    pub name: String,
    pub field: FieldId,
}

/// What to compute. Filters are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    pub filters: Vec<Filter>,
    pub groups: Vec<Grouping>,
    pub aggregations: Vec<Aggregation>,
    pub time_bucket: Option<TimeBucket>,
    pub weight: Option<WeightColumn>,
    pub hist_kind: HistKind,
    /// Sort by the mean of this aggregation instead of by count
    pub order_by: Option<String>,
    pub limit: usize,
    /// Retain matching rows instead of aggregating
    pub samples: bool,
    pub cache_queries: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            groups: Vec::new(),
            aggregations: Vec::new(),
            time_bucket: None,
            weight: None,
            hist_kind: HistKind::Basic,
            order_by: None,
            limit: DEFAULT_LIMIT,
            samples: false,
            cache_queries: false,
        }
    }
}

/// The part of [`QueryParams`] that determines a block's grouped results.
#[derive(Serialize)]
struct CacheableParams<'a> {
    filters: Vec<&'a Filter>,
    groups: &'a [Grouping],
    aggregations: &'a [Aggregation],
    time_bucket: &'a Option<TimeBucket>,
    weight: &'a Option<WeightColumn>,
    hist_kind: HistKind,
    num_buckets: usize,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group(mut self, grouping: Grouping) -> Self {
        self.groups.push(grouping);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn time_bucket(mut self, bucket: TimeBucket) -> Self {
        self.time_bucket = Some(bucket);
        self
    }

    pub fn weight(mut self, weight: WeightColumn) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn hist_kind(mut self, kind: HistKind) -> Self {
        self.hist_kind = kind;
        self
    }

    pub fn order_by(mut self, name: impl Into<String>) -> Self {
        self.order_by = Some(name.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn samples(mut self, enabled: bool) -> Self {
        self.samples = enabled;
        self
    }

    pub fn cache_queries(mut self, enabled: bool) -> Self {
        self.cache_queries = enabled;
        self
    }

    /// Hex SHA-256 of the parameters that shape one block's results. Range
    /// filters that every record of the block passes are left out, so a
    /// query over a wider window can reuse the block's entry. Limit, order
    /// and sampling never affect it.
    pub fn cache_key(&self, info: &SavedColumnInfo, num_buckets: usize) -> Result<String> {
        let cacheable = CacheableParams {
            filters: self
                .filters
                .iter()
                .filter(|f| !f.always_true(info))
                .collect(),
            groups: &self.groups,
            aggregations: &self.aggregations,
            time_bucket: &self.time_bucket,
            weight: &self.weight,
            hist_kind: self.hist_kind,
            num_buckets,
        };
        let bytes = bincode::serialize(&cacheable)?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Compile regex filters, in filter order.
    pub(crate) fn compile_regexes(&self) -> Result<Vec<Option<Regex>>> {
        self.filters
            .iter()
            .map(|filter| match filter {
                Filter::Str {
                    op: StrOp::Re | StrOp::Nre,
                    value,
                    ..
                } => Regex::new(value)
                    .map(Some)
                    .map_err(|e| Error::InvalidQuery(format!("bad regex {}: {}", value, e))),
                _ => Ok(None),
            })
            .collect()
    }
}

/// Accumulated state of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupResult {
    pub group_key: String,
    /// Weighted count
    pub count: i64,
    /// Raw record count
    pub samples: i64,
    pub hists: BTreeMap<String, Histogram>,
    pub distinct: BTreeMap<String, HyperLogLog>,
}

impl GroupResult {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            ..Default::default()
        }
    }

    /// Fold `other` into `self`. Histograms and sketches present on only one
    /// side are carried over.
    pub fn combine(&mut self, other: &GroupResult) {
        self.count += other.count;
        self.samples += other.samples;
        for (name, hist) in &other.hists {
            match self.hists.get_mut(name) {
                Some(mine) => mine.combine(hist),
                None => {
                    self.hists.insert(name.clone(), hist.clone());
                }
            }
        }
        for (name, sketch) in &other.distinct {
            match self.distinct.get_mut(name) {
                Some(mine) => mine.merge(sketch),
                None => {
                    self.distinct.insert(name.clone(), sketch.clone());
                }
            }
        }
    }

    pub fn hist(&self, name: &str) -> Option<&Histogram> {
        self.hists.get(name)
    }

    pub fn distinct_count(&self, name: &str) -> Option<u64> {
        self.distinct.get(name).map(HyperLogLog::estimate)
    }
}

pub type ResultMap = HashMap<String, GroupResult>;

/// Output of a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResults {
    /// Rollup of every matching record, including ones whose group was
    /// dropped by the group cap
    pub cumulative: GroupResult,
    pub results: ResultMap,
    pub time_results: BTreeMap<i64, ResultMap>,
    /// Per-bucket rollup
    pub time_cumulative: BTreeMap<i64, GroupResult>,
    /// `results` ordered and truncated to the limit
    pub sorted: Vec<GroupResult>,
    pub matched: Vec<Row>,
}

impl QueryResults {
    pub fn new() -> Self {
        Self {
            cumulative: GroupResult::new(TOTAL_KEY),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.samples == 0 && self.matched.is_empty()
    }
}

/// A query and, once executed, its results.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub params: QueryParams,
    pub results: QueryResults,
}

impl QuerySpec {
    pub fn new(params: QueryParams) -> Self {
        Self {
            params,
            results: QueryResults::new(),
        }
    }
}
