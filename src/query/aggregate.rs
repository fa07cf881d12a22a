//! Per-block filter and aggregation.
//!
//! Group keys are built in binary while scanning: one 8-byte little-endian
//! slot per grouping column holding the integer value or the block-local
//! string ID (`u64::MAX` when unpopulated), followed by a presence bitmap.
//! Keys are translated to display strings once, after the block has been
//! scanned, which is the only place string IDs get resolved.

use byteorder::{ByteOrder, LittleEndian};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::block::{record_to_row, TableBlock};
use crate::column::TableColumn;
use crate::hist::{HistParams, Histogram};
use crate::query::filter::BoundFilter;
use crate::query::params::{
    AggOp, GroupResult, QueryParams, QueryResults, ResultMap, GROUP_DELIMITER, TOTAL_KEY,
};
use crate::record::{FieldId, FieldType, Record};
use crate::table::info::IntInfo;
use crate::table::keys::KeyTable;

const SLOT_WIDTH: usize = 8;
const UNPOPULATED: u64 = u64::MAX;

type KeyedResults = HashMap<Vec<u8>, GroupResult>;

/// Everything a block scan reads besides the block itself.
pub struct Scanner<'a> {
    pub params: &'a QueryParams,
    pub regexes: &'a [Option<Regex>],
    /// Table-wide stats used to size histograms
    pub int_info: &'a BTreeMap<FieldId, IntInfo>,
    pub keys: &'a KeyTable,
    pub num_buckets: usize,
    /// Cap on groups per block
    pub max_groups: usize,
}

impl<'a> Scanner<'a> {
    /// Filter and aggregate every record of `block`.
    pub fn scan(&self, block: &mut TableBlock) -> QueryResults {
        let filters: Vec<BoundFilter> = self
            .params
            .filters
            .iter()
            .zip(self.regexes)
            .filter_map(|(filter, re)| BoundFilter::bind(filter, re.as_ref(), &block.columns))
            .collect();

        let mut out = QueryResults::new();
        let mut results: KeyedResults = HashMap::new();
        let mut time_results: BTreeMap<i64, KeyedResults> = BTreeMap::new();
        let mut key = Vec::with_capacity(self.key_len());

        let TableBlock {
            records, columns, ..
        } = block;

        for record in records.iter() {
            if !filters.iter().all(|f| f.matches(record, columns)) {
                continue;
            }

            let weight = match &self.params.weight {
                Some(w) => record.int(w.field).unwrap_or(1),
                None => 1,
            };

            if self.params.samples {
                out.cumulative.count += weight;
                out.cumulative.samples += 1;
                if out.matched.len() < self.params.limit {
                    out.matched.push(record_to_row(record, columns, self.keys));
                }
                if out.matched.len() >= self.params.limit {
                    break;
                }
                continue;
            }

            self.add_record(&mut out.cumulative, record, columns, weight);

            self.build_key(record, &mut key);
            if let Some(result) = self.group_slot(&mut results, &key) {
                self.add_record(result, record, columns, weight);
            }

            let Some(bucket) = self.time_bucket(record) else {
                continue;
            };
            let rollup = out
                .time_cumulative
                .entry(bucket)
                .or_insert_with(|| GroupResult::new(TOTAL_KEY));
            self.add_record(rollup, record, columns, weight);

            let grouped = time_results.entry(bucket).or_default();
            if let Some(result) = self.group_slot(grouped, &key) {
                self.add_record(result, record, columns, weight);
            }
        }

        out.results = self.translate(results, columns);
        out.time_results = time_results
            .into_iter()
            .map(|(bucket, keyed)| (bucket, self.translate(keyed, columns)))
            .collect();
        out
    }

    fn key_len(&self) -> usize {
        let groups = self.params.groups.len();
        groups * SLOT_WIDTH + groups.div_ceil(8)
    }

    fn build_key(&self, record: &Record, key: &mut Vec<u8>) {
        key.clear();
        let groups = &self.params.groups;
        let mut presence = vec![0u8; groups.len().div_ceil(8)];
        let mut slot = [0u8; SLOT_WIDTH];

        for (i, group) in groups.iter().enumerate() {
            let value = match group.ty {
                FieldType::Int => record.int(group.field).map(|v| v as u64),
                FieldType::Str => record.str_id(group.field).map(|v| v as u32 as u64),
                _ => None,
            };
            if value.is_some() {
                presence[i / 8] |= 1 << (i % 8);
            }
            LittleEndian::write_u64(&mut slot, value.unwrap_or(UNPOPULATED));
            key.extend_from_slice(&slot);
        }
        key.extend_from_slice(&presence);
    }

    /// The group for `key`, created if there is still room.
    fn group_slot<'r>(&self, results: &'r mut KeyedResults, key: &[u8]) -> Option<&'r mut GroupResult> {
        if !results.contains_key(key) {
            if results.len() >= self.max_groups {
                return None;
            }
            results.insert(key.to_vec(), GroupResult::default());
        }
        results.get_mut(key)
    }

    fn time_bucket(&self, record: &Record) -> Option<i64> {
        let bucket = self.params.time_bucket.as_ref()?;
        let t = record.int(bucket.field)?;
        let width = bucket.width.max(1);
        Some(t.div_euclid(width) * width)
    }

    fn add_record(
        &self,
        result: &mut GroupResult,
        record: &Record,
        columns: &HashMap<FieldId, TableColumn>,
        weight: i64,
    ) {
        result.count += weight;
        result.samples += 1;

        for agg in &self.params.aggregations {
            match agg.op {
                AggOp::Avg | AggOp::Hist => {
                    let Some(value) = record.int(agg.field) else {
                        continue;
                    };
                    if !result.hists.contains_key(&agg.name) {
                        let hist = self.new_hist(agg.field, agg.op == AggOp::Hist, value);
                        result.hists.insert(agg.name.clone(), hist);
                    }
                    if let Some(hist) = result.hists.get_mut(&agg.name) {
                        hist.add(value, weight);
                    }
                }
                AggOp::Distinct => {
                    let sketch = result.distinct.entry(agg.name.clone()).or_default();
                    match record.field_type(agg.field) {
                        FieldType::Int => sketch.insert_int(record.ints[agg.field as usize]),
                        FieldType::Str => {
                            sketch.insert_str(resolve(columns, agg.field, record.strs[agg.field as usize]))
                        }
                        FieldType::Set => {
                            for id in record.set_ids(agg.field).unwrap_or_default() {
                                sketch.insert_str(resolve(columns, agg.field, *id));
                            }
                        }
                        FieldType::None => {}
                    }
                }
            }
        }
    }

    fn new_hist(&self, field: FieldId, track_percentiles: bool, first: i64) -> Histogram {
        let params = HistParams::new(self.params.hist_kind, self.num_buckets, track_percentiles);
        match self.int_info.get(&field) {
            Some(info) => Histogram::new(&params, info.min, info.max),
            None => Histogram::new(&params, first, first),
        }
    }

    fn translate(&self, keyed: KeyedResults, columns: &HashMap<FieldId, TableColumn>) -> ResultMap {
        let mut out: ResultMap = HashMap::with_capacity(keyed.len());
        for (key, mut result) in keyed {
            result.group_key = self.display_key(&key, columns);
            match out.get_mut(&result.group_key) {
                Some(existing) => existing.combine(&result),
                None => {
                    out.insert(result.group_key.clone(), result);
                }
            }
        }
        out
    }

    fn display_key(&self, key: &[u8], columns: &HashMap<FieldId, TableColumn>) -> String {
        let groups = &self.params.groups;
        if groups.is_empty() {
            return TOTAL_KEY.to_string();
        }
        let presence = &key[groups.len() * SLOT_WIDTH..];

        let segments: Vec<String> = groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                if presence[i / 8] & (1 << (i % 8)) == 0 {
                    return String::new();
                }
                let slot = LittleEndian::read_u64(&key[i * SLOT_WIDTH..(i + 1) * SLOT_WIDTH]);
                match group.ty {
                    FieldType::Int => (slot as i64).to_string(),
                    FieldType::Str => resolve(columns, group.field, slot as u32 as i32).to_string(),
                    _ => String::new(),
                }
            })
            .collect();
        segments.join(GROUP_DELIMITER)
    }
}

fn resolve(columns: &HashMap<FieldId, TableColumn>, field: FieldId, id: i32) -> &str {
    columns.get(&field).map_or("", |col| col.value(id))
}
