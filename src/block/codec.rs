//! Column file formats.
//!
//! Each populated field of a block is written to its own file. A column with
//! fewer distinct values than the cutoff is bucket-encoded: one bucket per
//! value holding the ascending, delta-encoded indices of the records that
//! carry it. Anything at or above the cutoff is value-encoded: one slot per
//! record, each delta-encoded against the previous slot, with unpopulated
//! records listed separately.
//!
//! String and set columns ship their own dictionary. Decoding remaps it into
//! the block's [`TableColumn`], so columns encoded independently can be
//! loaded into the same block.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::column::TableColumn;
use crate::error::{Error, Result};
use crate::record::{FieldId, Record};
use crate::table::info::SavedColumnInfo;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket<T> {
    pub value: T,
    /// Delta-encoded record indices
    pub records: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Encoding<T> {
    Bucketed(Vec<Bucket<T>>),
    Valued {
        /// Delta-encoded, one slot per record
        values: Vec<T>,
        /// Delta-encoded indices of unpopulated records
        missing: Vec<u32>,
    },
}

impl<T> Encoding<T> {
    pub fn is_bucketed(&self) -> bool {
        matches!(self, Encoding::Bucketed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedIntColumn {
    pub name: String,
    pub encoding: Encoding<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedStrColumn {
    pub name: String,
    pub string_table: Vec<String>,
    pub encoding: Encoding<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetEncoding {
    Bucketed(Vec<Bucket<i32>>),
    /// Members per record; empty means unpopulated
    Valued(Vec<Vec<i32>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSetColumn {
    pub name: String,
    pub string_table: Vec<String>,
    pub encoding: SetEncoding,
}

/// A compiled string replacement rule, applied to dictionary values while
/// decoding.
#[derive(Debug, Clone)]
pub struct Replacement {
    pub pattern: Regex,
    pub replacement: String,
}

impl Replacement {
    pub fn apply<'a>(&self, value: &'a str) -> std::borrow::Cow<'a, str> {
        self.pattern.replace_all(value, self.replacement.as_str())
    }
}

fn delta_encode(indices: &mut [u32]) {
    let mut prev = 0u32;
    for idx in indices.iter_mut() {
        let current = *idx;
        *idx = current.wrapping_sub(prev);
        prev = current;
    }
}

fn delta_decode(deltas: &[u32]) -> impl Iterator<Item = usize> + '_ {
    deltas.iter().scan(0u32, |prev, delta| {
        *prev = prev.wrapping_add(*delta);
        Some(*prev as usize)
    })
}

fn slot<'a>(records: &'a mut [Record], idx: usize, column: &str) -> Result<&'a mut Record> {
    let len = records.len();
    records.get_mut(idx).ok_or_else(|| {
        Error::Corrupted(format!(
            "column {} references record {} of {}",
            column, idx, len
        ))
    })
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::RecordCountMismatch { expected, actual });
    }
    Ok(())
}

/// Group record indices by value, in first-seen value order.
fn invert<T: Copy + Ord>(values: impl Iterator<Item = (usize, T)>) -> Vec<Bucket<T>> {
    let mut order: BTreeMap<T, usize> = BTreeMap::new();
    let mut buckets: Vec<Bucket<T>> = Vec::new();
    for (idx, value) in values {
        let pos = *order.entry(value).or_insert_with(|| {
            buckets.push(Bucket {
                value,
                records: Vec::new(),
            });
            buckets.len() - 1
        });
        buckets[pos].records.push(idx as u32);
    }
    buckets
}

pub fn encode_int_column(
    name: &str,
    field: FieldId,
    records: &[Record],
    cutoff: usize,
    info: &mut SavedColumnInfo,
) -> SavedIntColumn {
    let mut buckets = invert(
        records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.int(field).map(|v| (idx, v))),
    );
    for bucket in &buckets {
        for _ in 0..bucket.records.len() {
            info.update_int(name, bucket.value);
        }
    }

    let encoding = if buckets.len() < cutoff {
        buckets.iter_mut().for_each(|b| delta_encode(&mut b.records));
        Encoding::Bucketed(buckets)
    } else {
        let mut values = Vec::with_capacity(records.len());
        let mut missing = Vec::new();
        let mut prev = 0i64;
        for (idx, record) in records.iter().enumerate() {
            let value = match record.int(field) {
                Some(v) => v,
                None => {
                    missing.push(idx as u32);
                    prev
                }
            };
            values.push(value.wrapping_sub(prev));
            prev = value;
        }
        delta_encode(&mut missing);
        Encoding::Valued { values, missing }
    };

    SavedIntColumn {
        name: name.to_string(),
        encoding,
    }
}

pub fn decode_int_column(col: &SavedIntColumn, field: FieldId, records: &mut [Record]) -> Result<()> {
    match &col.encoding {
        Encoding::Bucketed(buckets) => {
            for bucket in buckets {
                for idx in delta_decode(&bucket.records) {
                    slot(records, idx, &col.name)?.set_int(field, bucket.value);
                }
            }
        }
        Encoding::Valued { values, missing } => {
            check_len(records.len(), values.len())?;
            let mut missing = delta_decode(missing).peekable();
            let mut prev = 0i64;
            for (idx, (record, delta)) in records.iter_mut().zip(values).enumerate() {
                prev = prev.wrapping_add(*delta);
                if missing.peek() == Some(&idx) {
                    missing.next();
                    continue;
                }
                record.set_int(field, prev);
            }
        }
    }
    Ok(())
}

/// Re-intern the block-local IDs used by `records` into a fresh dictionary
/// holding only values that are actually used.
struct Compactor<'a> {
    source: &'a TableColumn,
    ids: BTreeMap<i32, i32>,
    table: Vec<String>,
}

impl<'a> Compactor<'a> {
    fn new(source: &'a TableColumn) -> Self {
        Self {
            source,
            ids: BTreeMap::new(),
            table: Vec::new(),
        }
    }

    fn id(&mut self, local: i32) -> i32 {
        let next = self.table.len() as i32;
        let source = self.source;
        let table = &mut self.table;
        *self.ids.entry(local).or_insert_with(|| {
            table.push(source.value(local).to_string());
            next
        })
    }
}

pub fn encode_str_column(
    name: &str,
    field: FieldId,
    records: &[Record],
    column: &TableColumn,
    cutoff: usize,
    info: &mut SavedColumnInfo,
) -> SavedStrColumn {
    let mut compactor = Compactor::new(column);
    let mut buckets = invert(
        records
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.str_id(field).map(|v| (idx, v))),
    );
    for bucket in buckets.iter_mut() {
        info.update_str(name, column.value(bucket.value), bucket.records.len() as i64);
        bucket.value = compactor.id(bucket.value);
    }
    if let Some(str_info) = info.str_info.get_mut(name) {
        str_info.prune();
    }

    let encoding = if buckets.len() < cutoff {
        buckets.iter_mut().for_each(|b| delta_encode(&mut b.records));
        Encoding::Bucketed(buckets)
    } else {
        let mut values = Vec::with_capacity(records.len());
        let mut missing = Vec::new();
        let mut prev = 0i32;
        for (idx, record) in records.iter().enumerate() {
            let value = match record.str_id(field) {
                Some(v) => compactor.id(v),
                None => {
                    missing.push(idx as u32);
                    prev
                }
            };
            values.push(value.wrapping_sub(prev));
            prev = value;
        }
        delta_encode(&mut missing);
        Encoding::Valued { values, missing }
    };

    SavedStrColumn {
        name: name.to_string(),
        string_table: compactor.table,
        encoding,
    }
}

/// Map the column file's dictionary onto the block's, applying `replace`
/// first. Values that collapse onto the same replaced string share an ID.
fn remap_dictionary(
    string_table: &[String],
    column: &mut TableColumn,
    replace: Option<&Replacement>,
) -> Vec<i32> {
    string_table
        .iter()
        .map(|value| match replace {
            Some(rule) => column.value_id(&rule.apply(value)),
            None => column.value_id(value),
        })
        .collect()
}

fn remapped(remap: &[i32], id: i32, column: &str) -> Result<i32> {
    if id < 0 {
        return Err(Error::Corrupted(format!(
            "column {} has negative string id {}",
            column, id
        )));
    }
    remap.get(id as usize).copied().ok_or_else(|| {
        Error::Corrupted(format!(
            "column {} references string {} of {}",
            column,
            id,
            remap.len()
        ))
    })
}

pub fn decode_str_column(
    col: &SavedStrColumn,
    field: FieldId,
    records: &mut [Record],
    column: &mut TableColumn,
    replace: Option<&Replacement>,
) -> Result<()> {
    let remap = remap_dictionary(&col.string_table, column, replace);

    match &col.encoding {
        Encoding::Bucketed(buckets) => {
            for bucket in buckets {
                let id = remapped(&remap, bucket.value, &col.name)?;
                for idx in delta_decode(&bucket.records) {
                    slot(records, idx, &col.name)?.set_str_id(field, id);
                }
            }
        }
        Encoding::Valued { values, missing } => {
            check_len(records.len(), values.len())?;
            let mut missing = delta_decode(missing).peekable();
            let mut prev = 0i32;
            for (idx, (record, delta)) in records.iter_mut().zip(values).enumerate() {
                prev = prev.wrapping_add(*delta);
                if missing.peek() == Some(&idx) {
                    missing.next();
                    continue;
                }
                record.set_str_id(field, remapped(&remap, prev, &col.name)?);
            }
        }
    }
    Ok(())
}

pub fn encode_set_column(
    name: &str,
    field: FieldId,
    records: &[Record],
    column: &TableColumn,
    cutoff: usize,
) -> SavedSetColumn {
    let mut compactor = Compactor::new(column);
    let mut buckets = invert(records.iter().enumerate().flat_map(|(idx, r)| {
        r.set_ids(field)
            .unwrap_or_default()
            .iter()
            .map(move |member| (idx, *member))
    }));
    for bucket in buckets.iter_mut() {
        bucket.value = compactor.id(bucket.value);
    }

    let encoding = if buckets.len() < cutoff {
        buckets.iter_mut().for_each(|b| delta_encode(&mut b.records));
        SetEncoding::Bucketed(buckets)
    } else {
        let values = records
            .iter()
            .map(|r| {
                r.set_ids(field)
                    .unwrap_or_default()
                    .iter()
                    .map(|member| compactor.id(*member))
                    .collect()
            })
            .collect();
        SetEncoding::Valued(values)
    };

    SavedSetColumn {
        name: name.to_string(),
        string_table: compactor.table,
        encoding,
    }
}

pub fn decode_set_column(
    col: &SavedSetColumn,
    field: FieldId,
    records: &mut [Record],
    column: &mut TableColumn,
    replace: Option<&Replacement>,
) -> Result<()> {
    let remap = remap_dictionary(&col.string_table, column, replace);

    match &col.encoding {
        SetEncoding::Bucketed(buckets) => {
            for bucket in buckets {
                let id = remapped(&remap, bucket.value, &col.name)?;
                for idx in delta_decode(&bucket.records) {
                    slot(records, idx, &col.name)?.push_set_id(field, id);
                }
            }
        }
        SetEncoding::Valued(values) => {
            check_len(records.len(), values.len())?;
            for (record, members) in records.iter_mut().zip(values) {
                if members.is_empty() {
                    continue;
                }
                let ids = members
                    .iter()
                    .map(|m| remapped(&remap, *m, &col.name))
                    .collect::<Result<Vec<_>>>()?;
                record.set_set_ids(field, ids);
            }
        }
    }
    Ok(())
}
