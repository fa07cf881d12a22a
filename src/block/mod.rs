pub mod codec;
pub mod slab;

pub use codec::Replacement;
pub use slab::RecordPool;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::column::TableColumn;
use crate::config::Config;
use crate::encoding::file;
use crate::error::{Error, Result};
use crate::record::{FieldId, FieldType, Record, Row, Value};
use crate::table::info::SavedColumnInfo;
use crate::table::keys::KeyTable;

pub const INFO_FILE: &str = "info.db";

/// Column file for a field, without the compression suffix.
pub fn column_path(dir: &Path, ty: FieldType, name: &str) -> Option<PathBuf> {
    let prefix = match ty {
        FieldType::Int => "int",
        FieldType::Str => "str",
        FieldType::Set => "set",
        FieldType::None => return None,
    };
    Some(dir.join(format!("{}_{}.db", prefix, name)))
}

/// Read a block's `info.db`.
pub fn load_info(dir: &Path) -> Result<SavedColumnInfo> {
    file::read_file(&dir.join(INFO_FILE))
}

/// Resolve `record` through the dictionaries of the block it came from.
pub fn record_to_row(
    record: &Record,
    columns: &HashMap<FieldId, TableColumn>,
    keys: &KeyTable,
) -> Row {
    let resolve = |field: FieldId, id: i32| columns.get(&field).map_or("", |c| c.value(id)).to_string();

    let mut row = Row::new();
    for (idx, ty) in record.populated.iter().enumerate() {
        let field = idx as FieldId;
        let Some(name) = keys.name(field) else {
            continue;
        };
        let value = match ty {
            FieldType::None => continue,
            FieldType::Int => Value::Int(record.ints[idx]),
            FieldType::Str => Value::Str(resolve(field, record.strs[idx])),
            FieldType::Set => Value::Set(
                record
                    .set_ids(field)
                    .unwrap_or_default()
                    .iter()
                    .map(|id| resolve(field, *id))
                    .collect(),
            ),
        };
        row.fields.push((name.to_string(), value));
    }
    row
}

/// An in-memory block: its records, per-field string dictionaries and
/// persisted statistics. Records only make sense together with this block's
/// columns.
#[derive(Debug)]
pub struct TableBlock {
    pub dir: PathBuf,
    pub records: Vec<Record>,
    pub columns: HashMap<FieldId, TableColumn>,
    pub info: SavedColumnInfo,
    /// Bytes on disk across every loaded file
    pub size: u64,
    regex_cache_size: usize,
}

impl TableBlock {
    pub fn new(dir: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            dir: dir.into(),
            records: Vec::new(),
            columns: HashMap::new(),
            info: SavedColumnInfo::default(),
            size: 0,
            regex_cache_size: config.regex_cache_size,
        }
    }

    /// Directory basename, used as the block's identity.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column(&self, field: FieldId) -> Option<&TableColumn> {
        self.columns.get(&field)
    }

    pub fn column_mut(&mut self, field: FieldId) -> &mut TableColumn {
        let size = self.regex_cache_size;
        self.columns
            .entry(field)
            .or_insert_with(|| TableColumn::new(size))
    }

    /// Resolve a block-local string ID.
    pub fn resolve(&self, field: FieldId, id: i32) -> &str {
        self.columns.get(&field).map_or("", |col| col.value(id))
    }

    /// Intern `row` into this block. Fields whose type conflicts with the
    /// table's existing type for that name are dropped.
    pub fn push_row(&mut self, row: &Row, keys: &mut KeyTable) {
        let mut record = Record::with_fields(keys.len());
        for (name, value) in &row.fields {
            let Some(field) = keys.get_or_insert(name, value.field_type()) else {
                warn!(
                    field = %name,
                    expected = %keys.id(name).map(|id| keys.field_type(id)).unwrap_or_default(),
                    actual = %value.field_type(),
                    "dropping field with conflicting type"
                );
                continue;
            };
            match value {
                Value::Int(v) => record.set_int(field, *v),
                Value::Str(s) => {
                    let id = self.column_mut(field).value_id(s);
                    record.set_str_id(field, id);
                }
                Value::Set(members) => {
                    let column = self.column_mut(field);
                    let ids = members.iter().map(|m| column.value_id(m)).collect();
                    record.set_set_ids(field, ids);
                }
            }
        }
        self.records.push(record);
    }

    /// Resolve a record of this block into a scope-free row.
    pub fn to_row(&self, record: &Record, keys: &KeyTable) -> Row {
        record_to_row(record, &self.columns, keys)
    }

    /// Order records by an integer column, unpopulated first.
    pub fn sort_by_int(&mut self, field: FieldId) {
        self.records
            .sort_by_key(|r| r.int(field).map_or((false, 0), |v| (true, v)));
    }

    /// Write every populated column and then `info.db` into `self.dir`. The
    /// info file goes last, so a block without one is incomplete.
    pub fn save(&mut self, keys: &KeyTable, config: &Config) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::WriteError(self.dir.display().to_string(), e))?;

        let cutoff = config.value_encoding_cutoff();
        let mut info = SavedColumnInfo {
            num_records: self.records.len(),
            ..Default::default()
        };
        let mut size = 0u64;
        let empty = TableColumn::default();

        for (field, name, ty) in keys.fields() {
            let populated = self.records.iter().any(|r| r.field_type(field) == ty);
            let Some(path) = column_path(&self.dir, ty, name).filter(|_| populated) else {
                continue;
            };

            let written = match ty {
                FieldType::Int => {
                    let col = codec::encode_int_column(name, field, &self.records, cutoff, &mut info);
                    file::write_file(&path, &col, config.compress)?
                }
                FieldType::Str => {
                    let column = self.columns.get(&field).unwrap_or(&empty);
                    let col =
                        codec::encode_str_column(name, field, &self.records, column, cutoff, &mut info);
                    file::write_file(&path, &col, config.compress)?
                }
                FieldType::Set => {
                    let column = self.columns.get(&field).unwrap_or(&empty);
                    let col = codec::encode_set_column(name, field, &self.records, column, cutoff);
                    file::write_file(&path, &col, config.compress)?
                }
                FieldType::None => continue,
            };
            size += fs::metadata(&written).map(|m| m.len()).unwrap_or(0);
        }

        let written = file::write_file(&self.dir.join(INFO_FILE), &info, config.compress)?;
        size += fs::metadata(&written).map(|m| m.len()).unwrap_or(0);

        debug!(
            block = %self.dir.display(),
            records = info.num_records,
            bytes = size,
            "saved block"
        );
        self.info = info;
        self.size = size;
        Ok(())
    }
}

/// Everything a block load needs besides the block's directory.
pub struct BlockLoader<'a> {
    pub config: &'a Config,
    pub keys: &'a KeyTable,
    pub replacements: &'a HashMap<String, Replacement>,
    pub pool: Option<&'a RecordPool>,
}

impl<'a> BlockLoader<'a> {
    /// Load `fields` from the block at `dir`. Columns that were never
    /// written for this block leave their fields unpopulated. A column file
    /// that exists but does not decode fails the whole load.
    pub fn load(&self, dir: &Path, fields: &[FieldId]) -> Result<TableBlock> {
        let info = load_info(dir)?;
        let mut block = TableBlock::new(dir, self.config);

        block.records = match self.pool {
            Some(pool) => pool.checkout(info.num_records, self.keys.len()),
            None => (0..info.num_records)
                .map(|_| Record::with_fields(self.keys.len()))
                .collect(),
        };

        for field in fields {
            let ty = self.keys.field_type(*field);
            let Some(name) = self.keys.name(*field) else {
                continue;
            };
            let Some(path) = column_path(dir, ty, name).and_then(|p| file::resolve(&p)) else {
                continue;
            };
            block.size += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let replace = self.replacements.get(name);

            match ty {
                FieldType::Int => {
                    let col: codec::SavedIntColumn = file::read_file(&path)?;
                    codec::decode_int_column(&col, *field, &mut block.records)?;
                }
                FieldType::Str => {
                    let col: codec::SavedStrColumn = file::read_file(&path)?;
                    let column = block.column_mut(*field);
                    let mut column = std::mem::take(column);
                    let result =
                        codec::decode_str_column(&col, *field, &mut block.records, &mut column, replace);
                    block.columns.insert(*field, column);
                    result?;
                }
                FieldType::Set => {
                    let col: codec::SavedSetColumn = file::read_file(&path)?;
                    let column = block.column_mut(*field);
                    let mut column = std::mem::take(column);
                    let result =
                        codec::decode_set_column(&col, *field, &mut block.records, &mut column, replace);
                    block.columns.insert(*field, column);
                    result?;
                }
                FieldType::None => {}
            }
        }

        block.info = info;
        Ok(block)
    }
}

/// Compile configured replacement rules, skipping invalid patterns.
pub fn compile_replacements(config: &Config) -> HashMap<String, Replacement> {
    config
        .replacements
        .iter()
        .filter_map(|(column, rule)| match regex::Regex::new(&rule.pattern) {
            Ok(pattern) => Some((
                column.clone(),
                Replacement {
                    pattern,
                    replacement: rule.replacement.clone(),
                },
            )),
            Err(e) => {
                warn!(column = %column, pattern = %rule.pattern, error = %e, "invalid replacement");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use rand::Rng;

    fn sorted_row(mut row: Row) -> Row {
        row.fields.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, value) in row.fields.iter_mut() {
            if let Value::Set(members) = value {
                members.sort();
            }
        }
        row
    }

    fn round_trip(config: &Config, rows: &[Row]) -> Result<Vec<Row>> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("block0");

        let mut keys = KeyTable::default();
        let mut block = TableBlock::new(&dir, config);
        for row in rows {
            block.push_row(row, &mut keys);
        }
        block.save(&keys, config)?;

        let replacements = HashMap::new();
        let loader = BlockLoader {
            config,
            keys: &keys,
            replacements: &replacements,
            pool: None,
        };
        let fields: Vec<FieldId> = keys.fields().map(|(id, _, _)| id).collect();
        let loaded = loader.load(&dir, &fields)?;
        assert_eq!(loaded.info.num_records, rows.len());

        Ok(loaded
            .records
            .iter()
            .map(|r| sorted_row(loaded.to_row(r, &keys)))
            .collect())
    }

    fn random_rows(n: usize, cardinality: i64) -> Vec<Row> {
        let mut rng = rand::thread_rng();
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                if i % 7 != 0 {
                    row = row.int("age", rng.gen_range(0..cardinality));
                }
                if i % 5 != 0 {
                    row = row.str("name", format!("user{}", rng.gen_range(0..cardinality)));
                }
                if i % 3 == 0 {
                    let tags: Vec<String> = (0..rng.gen_range(1..4))
                        .map(|_| format!("t{}", rng.gen_range(0..cardinality)))
                        .collect();
                    row = row.set("tags", tags);
                }
                row
            })
            .collect()
    }

    #[test]
    fn test_round_trip_bucket_encoded() -> Result<()> {
        let config = Config::default().chunk_size(1000);
        let rows = random_rows(500, 10);
        let loaded = round_trip(&config, &rows)?;

        let expected: Vec<Row> = rows.into_iter().map(sorted_row).collect();
        assert_eq!(loaded, expected);
        Ok(())
    }

    #[test]
    fn test_round_trip_value_encoded() -> Result<()> {
        // 500 distinct values against a cutoff of 250
        let config = Config::default().chunk_size(1000);
        let rows = random_rows(500, 1_000_000);
        let loaded = round_trip(&config, &rows)?;

        let expected: Vec<Row> = rows.into_iter().map(sorted_row).collect();
        assert_eq!(loaded, expected);
        Ok(())
    }

    #[test]
    fn test_round_trip_compressed() -> Result<()> {
        let config = Config::default().chunk_size(100).compress(true);
        let rows = random_rows(100, 50);
        let loaded = round_trip(&config, &rows)?;

        let expected: Vec<Row> = rows.into_iter().map(sorted_row).collect();
        assert_eq!(loaded, expected);
        Ok(())
    }

    #[test]
    fn test_projection_and_stats() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("block0");
        let config = Config::default();

        let mut keys = KeyTable::default();
        let mut block = TableBlock::new(&dir, &config);
        for i in 0..10 {
            block.push_row(&Row::new().int("n", i).str("s", "x"), &mut keys);
        }
        block.save(&keys, &config)?;

        let n = keys.id("n").unwrap();
        assert_eq!(block.info.num_records, 10);
        assert_eq!(block.info.int_info["n"].min, 0);
        assert_eq!(block.info.int_info["n"].max, 9);
        assert_eq!(block.info.str_info["s"].top_counts["x"], 10);

        let replacements = HashMap::new();
        let loader = BlockLoader {
            config: &config,
            keys: &keys,
            replacements: &replacements,
            pool: None,
        };
        let loaded = loader.load(&dir, &[n])?;
        let s = keys.id("s").unwrap();
        assert_eq!(loaded.records[3].int(n), Some(3));
        assert_eq!(loaded.records[3].str_id(s), None, "Unprojected column stays empty");
        Ok(())
    }

    #[test]
    fn test_conflicting_type_dropped() {
        let config = Config::default();
        let mut keys = KeyTable::default();
        let mut block = TableBlock::new("unused", &config);
        block.push_row(&Row::new().int("a", 1), &mut keys);
        block.push_row(&Row::new().str("a", "oops").int("b", 2), &mut keys);

        let row = block.to_row(&block.records[1], &keys);
        assert_eq!(row, Row::new().int("b", 2));
    }

    #[test]
    fn test_corrupt_column_fails_load() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().join("block0");
        let config = Config::default();

        let mut keys = KeyTable::default();
        let mut block = TableBlock::new(&dir, &config);
        block.push_row(&Row::new().int("n", 1), &mut keys);
        block.save(&keys, &config)?;

        fs::write(dir.join("int_n.db"), b"garbage")?;
        let replacements = HashMap::new();
        let loader = BlockLoader {
            config: &config,
            keys: &keys,
            replacements: &replacements,
            pool: None,
        };
        assert!(matches!(loader.load(&dir, &[0]), Err(Error::Corrupted(_))));
        Ok(())
    }
}
