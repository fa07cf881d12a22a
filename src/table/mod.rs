pub mod info;
pub mod keys;

mod digest;
mod io;
mod load;
mod query_cache;
mod recover;
mod registry;
mod row_store;
mod trim;

pub use load::{LoadSpec, QueryStats};
pub use registry::Registry;
pub use trim::TrimSpec;

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::block::{compile_replacements, RecordPool, Replacement, TableBlock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock::{self, LockGuard, LockKind};
use crate::query::{
    AggOp, Aggregation, Filter, Grouping, IntOp, QuerySpec, SetOp, StrOp, TimeBucket,
    WeightColumn,
};
use crate::record::{FieldId, FieldType, Row};
use info::{IntInfo, StrInfo, TableMeta};
use keys::KeyTable;

/// Record arrays kept per shape for reuse across block loads.
const POOLED_SLABS: usize = 8;

/// Takeover attempts on a broken lock before giving up.
const MAX_TAKEOVERS: usize = 3;

/// Mutable table metadata, persisted as `info.db`.
#[derive(Debug, Default)]
pub(crate) struct TableState {
    pub(crate) keys: KeyTable,
    pub(crate) int_info: BTreeMap<FieldId, IntInfo>,
    pub(crate) str_info: BTreeMap<FieldId, StrInfo>,
}

impl TableState {
    fn from_meta(meta: &TableMeta) -> Self {
        Self {
            keys: KeyTable::from_meta(meta),
            int_info: meta.int_info.clone(),
            str_info: meta.str_info.clone(),
        }
    }

    fn to_meta(&self, name: &str) -> TableMeta {
        let mut meta = TableMeta {
            name: name.to_string(),
            int_info: self.int_info.clone(),
            str_info: self.str_info.clone(),
            ..Default::default()
        };
        self.keys.write_meta(&mut meta);
        meta
    }

    /// Fold in metadata another handle saved. Field IDs on disk win and
    /// fields only known here get the next free IDs. Saved stats win unless
    /// `own_stats`, in which case ours replace them field by field.
    fn merge_saved(&mut self, saved: &TableMeta, own_stats: bool) {
        let mut keys = KeyTable::from_meta(saved);
        let mut remap = HashMap::new();
        for (id, name, ty) in self.keys.fields() {
            match keys.get_or_insert(name, ty) {
                Some(merged) => {
                    remap.insert(id, merged);
                }
                None => warn!(table = %saved.name, field = name, "saved field type differs, dropping ours"),
            }
        }

        let mut int_info = saved.int_info.clone();
        let mut str_info = saved.str_info.clone();
        let ours_int = remap_stats(&self.int_info, &remap);
        let ours_str = remap_stats(&self.str_info, &remap);
        if own_stats {
            int_info.extend(ours_int);
            str_info.extend(ours_str);
        } else {
            for (field, stats) in ours_int {
                int_info.entry(field).or_insert(stats);
            }
            for (field, stats) in ours_str {
                str_info.entry(field).or_insert(stats);
            }
        }

        self.keys = keys;
        self.int_info = int_info;
        self.str_info = str_info;
    }
}

fn remap_stats<T: Clone>(
    stats: &BTreeMap<FieldId, T>,
    remap: &HashMap<FieldId, FieldId>,
) -> BTreeMap<FieldId, T> {
    stats
        .iter()
        .filter_map(|(field, s)| remap.get(field).map(|merged| (*merged, s.clone())))
        .collect()
}

/// A named dataset: the row-store log, its column blocks and the metadata
/// tying field names to IDs.
pub struct Table {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) config: Arc<Config>,
    pub(crate) state: RwLock<TableState>,
    buffer: Mutex<Vec<Row>>,
    pub(crate) pool: RecordPool,
    pub(crate) replacements: HashMap<String, Replacement>,
    broken: Mutex<BTreeSet<String>>,
    pub(crate) loaded: Mutex<Vec<TableBlock>>,
    /// Held for a whole digestion or stomache recovery in this process
    pub(crate) digesting: Mutex<()>,
}

impl Table {
    /// Open the table `name` under the configured root, creating its
    /// directory if needed.
    pub fn open(name: &str, config: Arc<Config>) -> Result<Self> {
        let dir = config.dir.join(name);
        fs::create_dir_all(&dir).map_err(|e| Error::WriteError(dir.display().to_string(), e))?;

        let state = match io::load_meta(&dir, name)? {
            Some(meta) => TableState::from_meta(&meta),
            None => TableState::default(),
        };
        debug!(table = name, fields = state.keys.len(), "opened table");

        Ok(Self {
            name: name.to_string(),
            replacements: compile_replacements(&config),
            dir,
            config,
            state: RwLock::new(state),
            buffer: Mutex::new(Vec::new()),
            pool: RecordPool::new(POOLED_SLABS),
            broken: Mutex::new(BTreeSet::new()),
            loaded: Mutex::new(Vec::new()),
            digesting: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of the table's field names and types.
    pub fn keys(&self) -> KeyTable {
        self.state.read().keys.clone()
    }

    pub fn int_info(&self, name: &str) -> Option<IntInfo> {
        let state = self.state.read();
        let field = state.keys.id(name)?;
        state.int_info.get(&field).cloned()
    }

    pub fn str_info(&self, name: &str) -> Option<StrInfo> {
        let state = self.state.read();
        let field = state.keys.id(name)?;
        state.str_info.get(&field).cloned()
    }

    /// Column block directories, oldest first.
    pub fn block_dirs(&self) -> Result<Vec<PathBuf>> {
        io::list_blocks(&self.dir)
    }

    /// Names of blocks set aside after failing to decode.
    pub fn broken_blocks(&self) -> BTreeSet<String> {
        self.broken.lock().clone()
    }

    /// Blocks kept by queries run with [`LoadSpec::keep_blocks`].
    pub fn take_loaded_blocks(&self) -> Vec<TableBlock> {
        std::mem::take(&mut *self.loaded.lock())
    }

    /// Exclude a block from future scans and move it aside.
    pub(crate) fn mark_broken(&self, dir: &Path) {
        let name = io::dir_name(dir);
        self.broken.lock().insert(name.clone());

        let result = self.grab_lock(LockKind::Block(name)).and_then(|_guard| {
            let target = io::with_suffix(dir, ".broken");
            fs::rename(dir, &target).map_err(|e| Error::WriteError(target.display().to_string(), e))
        });
        match result {
            Ok(()) => warn!(table = %self.name, block = %dir.display(), "marked block broken"),
            Err(e) => error!(table = %self.name, block = %dir.display(), error = %e, "failed to move broken block"),
        }
    }

    /// Take one of the table's locks. A broken lock is taken over and the
    /// files it guards are recovered before the guard is handed out.
    pub fn grab_lock(&self, kind: LockKind) -> Result<LockGuard> {
        let path = kind.path(&self.dir);
        let mut takeovers = 0;
        loop {
            match lock::grab(&path, &self.config.lock) {
                Err(Error::LockBroken { stale, .. }) if takeovers < MAX_TAKEOVERS => {
                    takeovers += 1;
                    if let Some(guard) = lock::steal(&path, stale, &self.config.lock)? {
                        recover::recover(self, &kind, &guard)?;
                        return Ok(guard);
                    }
                }
                other => return other,
            }
        }
    }

    /// Merge what other handles saved into `state`, then persist it, all
    /// under the info lock. See [`TableState::merge_saved`] for `own_stats`.
    pub(crate) fn save_info(&self, state: &mut TableState, own_stats: bool) -> Result<()> {
        let _guard = self.grab_lock(LockKind::Info)?;
        match io::load_meta(&self.dir, &self.name) {
            Ok(Some(saved)) => state.merge_saved(&saved, own_stats),
            Ok(None) => {}
            Err(e) => warn!(table = %self.name, error = %e, "overwriting unreadable table info"),
        }
        io::save_meta(&self.dir, &state.to_meta(&self.name))
    }

    /// Buffer a record until the next [`flush`](Self::flush).
    pub fn add_record(&self, row: Row) {
        if row.is_empty() {
            return;
        }
        self.buffer.lock().push(row);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Append buffered records to the row-store log and save the table
    /// info, then digest if the log crossed a threshold. Returns how many
    /// records were logged.
    ///
    /// Only a failed append fails the flush, and then the records stay
    /// buffered. Once appended they are logged for good: a failure to save
    /// the table info or to digest is logged and left for the next flush.
    pub fn flush(&self) -> Result<usize> {
        let mut rows = std::mem::take(&mut *self.buffer.lock());
        if rows.is_empty() {
            return Ok(0);
        }

        let logged = {
            let mut state = self.state.write();
            for row in rows.iter_mut() {
                row.fields.retain(|(name, value)| {
                    let ty = value.field_type();
                    let kept = state.keys.get_or_insert(name, ty).is_some();
                    if !kept {
                        warn!(table = %self.name, field = %name, actual = %ty, "dropping field with conflicting type");
                    }
                    kept
                });
            }
            rows.retain(|row| !row.is_empty());
            if rows.is_empty() {
                return Ok(0);
            }

            if let Err(e) = row_store::append(&self.dir, &rows) {
                error!(table = %self.name, error = %e, "failed to log records");
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, rows);
                buffer.extend(newer);
                return Err(e);
            }
            // Logged rows carry their field names, so a later save catches up
            if let Err(e) = self.save_info(&mut state, false) {
                warn!(table = %self.name, error = %e, "records logged, table info not saved");
            }
            rows.len()
        };

        match self.should_digest() {
            Ok(true) => {
                if let Err(e) = self.digest() {
                    warn!(table = %self.name, error = %e, "digest after flush failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(table = %self.name, error = %e, "failed to check row log"),
        }
        Ok(logged)
    }

    /// Whether the row-store log is big enough to digest.
    pub fn should_digest(&self) -> Result<bool> {
        let (files, bytes) = row_store::log_stats(&self.dir)?;
        Ok(files > self.config.file_digest_threshold || bytes > self.config.size_digest_threshold)
    }

    /// Move the row-store log into column blocks. Returns how many records
    /// were columnized.
    pub fn digest(&self) -> Result<usize> {
        digest::digest(self)
    }

    /// Finish or undo digestions interrupted by a crash. Returns how many
    /// were found.
    pub fn restore_undigested(&self) -> Result<usize> {
        let _running = self.digesting.lock();
        let guard = self.grab_lock(LockKind::Digest)?;
        recover::recover_stomaches(self, &guard)
    }

    /// A projection over this table's current fields.
    pub fn load_spec(&self) -> LoadSpec {
        LoadSpec::new(self.keys())
    }

    /// Run a query. Results land in `query.results`.
    pub fn query(&self, spec: &LoadSpec, query: &mut QuerySpec) -> Result<QueryStats> {
        load::execute(self, spec, query)
    }

    /// List, and with [`TrimSpec::delete`] remove, the oldest blocks.
    pub fn trim(&self, spec: &TrimSpec) -> Result<Vec<PathBuf>> {
        trim::trim(self, spec)
    }

    fn field(&self, name: &str, allowed: &[FieldType]) -> Result<(FieldId, FieldType)> {
        let state = self.state.read();
        let field = state
            .keys
            .id(name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))?;
        let actual = state.keys.field_type(field);
        if !allowed.contains(&actual) {
            return Err(Error::ColumnTypeMismatch {
                name: name.to_string(),
                expected: allowed[0],
                actual,
            });
        }
        Ok((field, actual))
    }

    pub fn int_filter(&self, name: &str, op: IntOp, value: i64) -> Result<Filter> {
        let (field, _) = self.field(name, &[FieldType::Int])?;
        Ok(Filter::Int {
            name: name.to_string(),
            field,
            op,
            value,
        })
    }

    pub fn str_filter(&self, name: &str, op: StrOp, value: &str) -> Result<Filter> {
        let (field, _) = self.field(name, &[FieldType::Str])?;
        Ok(Filter::Str {
            name: name.to_string(),
            field,
            op,
            value: value.to_string(),
        })
    }

    pub fn set_filter(&self, name: &str, op: SetOp, value: &str) -> Result<Filter> {
        let (field, _) = self.field(name, &[FieldType::Set])?;
        Ok(Filter::Set {
            name: name.to_string(),
            field,
            op,
            value: value.to_string(),
        })
    }

    /// Group by an integer or string column.
    pub fn grouping(&self, name: &str) -> Result<Grouping> {
        let (field, ty) = self.field(name, &[FieldType::Int, FieldType::Str])?;
        Ok(Grouping {
            name: name.to_string(),
            field,
            ty,
        })
    }

    /// `avg` and `hist` need an integer column; `distinct` also takes
    /// strings.
    pub fn aggregation(&self, name: &str, op: AggOp) -> Result<Aggregation> {
        let allowed: &[FieldType] = match op {
            AggOp::Avg | AggOp::Hist => &[FieldType::Int],
            AggOp::Distinct => &[FieldType::Int, FieldType::Str],
        };
        let (field, ty) = self.field(name, allowed)?;
        Ok(Aggregation {
            name: name.to_string(),
            field,
            ty,
            op,
        })
    }

    pub fn time_bucket(&self, name: &str, width: i64) -> Result<TimeBucket> {
        if width <= 0 {
            return Err(Error::InvalidQuery(format!(
                "time bucket width must be positive, got {}",
                width
            )));
        }
        let (field, _) = self.field(name, &[FieldType::Int])?;
        Ok(TimeBucket {
            name: name.to_string(),
            field,
            width,
        })
    }

    pub fn weight(&self, name: &str) -> Result<WeightColumn> {
        let (field, _) = self.field(name, &[FieldType::Int])?;
        Ok(WeightColumn {
            name: name.to_string(),
            field,
        })
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block;
    use crate::config::LockConfig;
    use crate::query::QueryParams;
    use crate::record::Value;
    use crate::tmpfs::TempDir;
    use super::digest::{self, Stage};
    use std::time::Duration;

    fn open(config: Config) -> Result<Table> {
        Table::open("events", Arc::new(config))
    }

    fn ingest(table: &Table, ids: std::ops::Range<i64>) -> Result<usize> {
        for id in ids {
            table.add_record(
                Row::new()
                    .int("id", id)
                    .int("age", 10 + id % 20)
                    .int("time", id)
                    .str("host", if id % 2 == 0 { "even" } else { "odd" }),
            );
        }
        table.flush()
    }

    fn count(table: &Table, params: QueryParams) -> Result<(i64, QueryStats)> {
        let mut query = QuerySpec::new(params);
        let stats = table.query(&table.load_spec(), &mut query)?;
        Ok((query.results.cumulative.count, stats))
    }

    #[test]
    fn test_group_by_with_average() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(100))?;

        assert_eq!(ingest(&table, 0..300)?, 300);
        assert_eq!(table.digest()?, 300);
        assert_eq!(table.block_dirs()?.len(), 3);

        let params = QueryParams::new()
            .group(table.grouping("age")?)
            .aggregate(table.aggregation("age", AggOp::Avg)?);
        let mut query = QuerySpec::new(params);
        let stats = table.query(&table.load_spec(), &mut query)?;

        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.row_store_records, 0, "Everything was digested");
        assert_eq!(query.results.cumulative.count, 300);
        assert_eq!(query.results.results.len(), 20);
        for group in query.results.results.values() {
            let key: f64 = group.group_key.parse().expect("Int group key");
            let mean = group.hist("age").expect("Average of age").mean();
            assert!((mean - key).abs() < 0.1, "group {} has mean {}", key, mean);
            assert_eq!(group.count, 15);
        }
        assert_eq!(query.results.sorted.len(), 20);
        Ok(())
    }

    #[test]
    fn test_rows_queryable_before_digestion() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(100))?;

        ingest(&table, 0..150)?;
        table.digest()?;
        ingest(&table, 150..160)?;

        let (total, stats) = count(&table, QueryParams::new())?;
        assert_eq!(total, 160);
        assert_eq!(stats.row_store_records, 10);

        let mut query = QuerySpec::new(QueryParams::new());
        let spec = table.load_spec().read_row_store(false);
        table.query(&spec, &mut query)?;
        assert_eq!(query.results.cumulative.count, 150, "Only column blocks");
        Ok(())
    }

    #[test]
    fn test_row_store_hist_spans_logged_values() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()))?;
        ingest(&table, 0..100)?;
        assert!(table.int_info("age").is_none(), "Nothing digested yet");

        let params = QueryParams::new()
            .group(table.grouping("host")?)
            .aggregate(table.aggregation("age", AggOp::Hist)?);
        let mut query = QuerySpec::new(params);
        table.query(&table.load_spec(), &mut query)?;

        for group in query.results.results.values() {
            let hist = group.hist("age").expect("age histogram");
            let (lo, hi) = hist.range();
            assert!(lo <= 10 && hi >= 28, "range {:?} should cover the logged ages", (lo, hi));
            assert_eq!(hist.count(), 50);
        }
        Ok(())
    }

    #[test]
    fn test_filters_partition_records() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(64))?;
        ingest(&table, 0..256)?;
        table.digest()?;

        let below = QueryParams::new().filter(table.int_filter("time", IntOp::Lt, 100)?);
        let above = QueryParams::new().filter(table.int_filter("time", IntOp::Gt, 99)?);
        let (below, below_stats) = count(&table, below)?;
        let (above, _) = count(&table, above)?;
        assert_eq!(below, 100);
        assert_eq!(above, 156);
        assert_eq!(below_stats.skipped, 2, "Blocks past the cutoff are pruned");

        let odd = QueryParams::new().filter(table.str_filter("host", StrOp::Eq, "odd")?);
        let not_odd = QueryParams::new().filter(table.str_filter("host", StrOp::Re, "^ev")?);
        assert_eq!(count(&table, odd)?.0 + count(&table, not_odd)?.0, 256);
        Ok(())
    }

    #[test]
    fn test_cached_results_match_recomputed() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::new(temp_dir.path()).chunk_size(50).cache_queries(true);
        let table = open(config)?;
        ingest(&table, 0..100)?;
        table.digest()?;

        let params = QueryParams::new()
            .group(table.grouping("host")?)
            .aggregate(table.aggregation("age", AggOp::Hist)?);
        let mut first = QuerySpec::new(params.clone());
        let first_stats = table.query(&table.load_spec(), &mut first)?;
        assert_eq!(first_stats.scanned, 2);

        let mut second = QuerySpec::new(params.clone());
        let second_stats = table.query(&table.load_spec(), &mut second)?;
        assert_eq!(second_stats.cached, 2);
        assert_eq!(first.results.results, second.results.results);

        // Any change to what a block computes is a different entry
        let mut other = QuerySpec::new(params.aggregate(table.aggregation("time", AggOp::Avg)?));
        let other_stats = table.query(&table.load_spec(), &mut other)?;
        assert_eq!(other_stats.cached, 0);
        Ok(())
    }

    #[test]
    fn test_samples_stop_at_limit() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(20))?;
        ingest(&table, 0..100)?;
        table.digest()?;

        let params = QueryParams::new()
            .filter(table.str_filter("host", StrOp::Eq, "even")?)
            .samples(true)
            .limit(5);
        let mut query = QuerySpec::new(params);
        let stats = table.query(&table.load_spec().all(), &mut query)?;

        assert_eq!(query.results.matched.len(), 5);
        assert!(stats.scanned < 5, "Sampling stops once the limit is met");
        for row in &query.results.matched {
            assert_eq!(row.get("host"), Some(&Value::Str("even".into())));
        }
        Ok(())
    }

    #[test]
    fn test_keep_blocks() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(40))?;
        ingest(&table, 0..100)?;
        table.digest()?;

        let spec = table.load_spec().int("age")?.keep_blocks(true);
        table.query(&spec, &mut QuerySpec::new(QueryParams::new()))?;
        let kept = table.take_loaded_blocks();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept.iter().map(|b| b.len()).sum::<usize>(), 100);
        assert!(table.take_loaded_blocks().is_empty());
        Ok(())
    }

    #[test]
    fn test_broken_block_set_aside() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(50))?;
        ingest(&table, 0..150)?;
        table.digest()?;

        let blocks = table.block_dirs()?;
        fs::write(blocks[1].join(block::INFO_FILE), b"junk")?;

        let (total, stats) = count(&table, QueryParams::new())?;
        assert_eq!(total, 100);
        assert_eq!(stats.broken, vec![io::dir_name(&blocks[1])]);
        assert!(table.broken_blocks().contains(&io::dir_name(&blocks[1])));
        assert!(io::with_suffix(&blocks[1], ".broken").exists());

        let (_, stats) = count(&table, QueryParams::new())?;
        assert_eq!(stats.blocks, 2);
        assert!(stats.broken.is_empty());
        Ok(())
    }

    #[test]
    fn test_builders_check_columns() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()))?;
        ingest(&table, 0..3)?;

        assert!(matches!(table.grouping("nope"), Err(Error::MissingColumn(_))));
        assert!(matches!(
            table.int_filter("host", IntOp::Eq, 1),
            Err(Error::ColumnTypeMismatch { .. })
        ));
        assert!(matches!(
            table.aggregation("host", AggOp::Avg),
            Err(Error::ColumnTypeMismatch { .. })
        ));
        assert!(table.aggregation("host", AggOp::Distinct).is_ok());
        assert!(matches!(
            table.load_spec().str("age"),
            Err(Error::ColumnTypeMismatch { .. })
        ));
        assert!(matches!(table.time_bucket("time", 0), Err(Error::InvalidQuery(_))));
        Ok(())
    }

    #[test]
    fn test_conflicting_field_type_dropped() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()))?;
        table.add_record(Row::new().int("age", 3));
        table.add_record(Row::new().str("age", "three"));
        table.add_record(Row::new());
        assert_eq!(table.buffered(), 2);
        assert_eq!(table.flush()?, 1);
        assert_eq!(table.keys().field_type(table.keys().id("age").expect("age")), FieldType::Int);
        Ok(())
    }

    #[test]
    fn test_metadata_survives_reopen() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Arc::new(Config::new(temp_dir.path()).chunk_size(10));
        {
            let table = Table::open("events", config.clone())?;
            ingest(&table, 0..25)?;
            table.digest()?;
        }

        let table = Table::open("events", config)?;
        assert_eq!(table.keys().len(), 4);
        let age = table.int_info("age").expect("age stats");
        assert_eq!((age.min, age.max), (10, 29));
        assert!(table.str_info("host").is_some());
        assert_eq!(count(&table, QueryParams::new())?.0, 25);
        Ok(())
    }

    #[test]
    fn test_topping_up_counts_rows_once() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()).chunk_size(100))?;
        ingest(&table, 0..30)?;
        table.digest()?;
        ingest(&table, 30..80)?;
        table.digest()?;

        assert_eq!(table.block_dirs()?.len(), 1, "The partial block was filled");
        assert_eq!(table.int_info("id").expect("id stats").count, 80);
        let host = table.str_info("host").expect("host stats");
        assert_eq!(host.top_counts["even"], 40);
        assert_eq!(count(&table, QueryParams::new())?.0, 80);
        Ok(())
    }

    fn quick_locks() -> LockConfig {
        LockConfig::default()
            .tries(3)
            .poll_interval(Duration::from_millis(1))
    }

    #[test]
    fn test_flush_logs_once_when_info_locked() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Arc::new(Config::new(temp_dir.path()).lock(quick_locks()));
        let table = Table::open("events", config.clone())?;

        let held = lock::grab(&LockKind::Info.path(table.dir()), &LockConfig::default())?;
        assert_eq!(ingest(&table, 0..10)?, 10, "Appended rows count as logged");
        assert_eq!(table.buffered(), 0);
        drop(held);

        assert_eq!(table.flush()?, 0, "Nothing is left to log again");
        assert_eq!(count(&table, QueryParams::new())?.0, 10);

        // The next flush saves the fields the first one could not
        ingest(&table, 10..15)?;
        let reopened = Table::open("events", config)?;
        assert!(reopened.keys().id("host").is_some());
        assert_eq!(count(&reopened, QueryParams::new())?.0, 15);
        Ok(())
    }

    #[test]
    fn test_flush_survives_failed_digest() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::new(temp_dir.path())
            .file_digest_threshold(0)
            .lock(quick_locks());
        let table = open(config)?;

        let held = lock::grab(&LockKind::Digest.path(table.dir()), &LockConfig::default())?;
        assert_eq!(ingest(&table, 0..10)?, 10);
        assert_eq!(table.buffered(), 0);
        assert!(table.block_dirs()?.is_empty(), "Digestion was locked out");
        drop(held);

        assert_eq!(table.digest()?, 10);
        let (total, stats) = count(&table, QueryParams::new())?;
        assert_eq!(total, 10);
        assert_eq!(stats.row_store_records, 0);
        Ok(())
    }

    #[test]
    fn test_concurrent_digests_share_log() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock = LockConfig::default()
            .lease(Duration::from_millis(5))
            .tries(5000)
            .poll_interval(Duration::from_millis(1));
        let table = open(Config::new(temp_dir.path()).chunk_size(50).lock(lock))?;
        ingest(&table, 0..5000)?;

        let (first, second) = std::thread::scope(|s| {
            let first = s.spawn(|| table.digest());
            let second = s.spawn(|| table.digest());
            (
                first.join().expect("Digest thread panicked"),
                second.join().expect("Digest thread panicked"),
            )
        });
        assert_eq!(first? + second?, 5000, "Each record digested once");

        let (total, stats) = count(&table, QueryParams::new())?;
        assert_eq!(total, 5000);
        assert_eq!(stats.row_store_records, 0);
        assert_eq!(table.int_info("id").expect("id stats").count, 5000);
        Ok(())
    }

    #[test]
    fn test_digests_from_two_handles() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock = LockConfig::default()
            .lease(Duration::from_millis(100))
            .tries(10_000)
            .poll_interval(Duration::from_millis(1));
        let config = Arc::new(Config::new(temp_dir.path()).chunk_size(20).lock(lock));
        let first = Table::open("events", config.clone())?;
        let second = Table::open("events", config.clone())?;
        ingest(&first, 0..4000)?;

        // Each handle stands in for a separate process
        let results = std::thread::scope(|s| {
            let a = s.spawn(|| first.digest());
            let b = s.spawn(|| second.digest());
            [
                a.join().expect("Digest thread panicked"),
                b.join().expect("Digest thread panicked"),
            ]
        });
        let mut digested = 0;
        for result in results {
            digested += result?;
        }
        assert_eq!(digested, 4000);

        let reopened = Table::open("events", config)?;
        let mut query =
            QuerySpec::new(QueryParams::new().group(reopened.grouping("id")?).limit(5000));
        let stats = reopened.query(&reopened.load_spec(), &mut query)?;
        assert_eq!(stats.row_store_records, 0);
        assert_eq!(query.results.cumulative.count, 4000);
        assert!(query.results.results.values().all(|g| g.count == 1));
        assert_eq!(reopened.int_info("id").expect("id stats").count, 4000);
        Ok(())
    }

    #[test]
    fn test_two_writers_keep_each_others_fields() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Arc::new(Config::new(temp_dir.path()).chunk_size(10));
        let first = Table::open("events", config.clone())?;
        let second = Table::open("events", config.clone())?;

        first.add_record(Row::new().int("alpha", 1));
        first.flush()?;
        second.add_record(Row::new().int("beta", 2));
        second.flush()?;
        assert_eq!(second.keys().id("alpha"), Some(0), "Saved IDs win");
        assert_eq!(second.keys().id("beta"), Some(1));

        first.digest()?;
        assert_eq!(first.keys().id("beta"), Some(1));

        // The second handle never digested, its stats must not replace the saved ones
        second.add_record(Row::new().int("beta", 3));
        second.flush()?;

        let reopened = Table::open("events", config)?;
        let alpha = QueryParams::new().filter(reopened.int_filter("alpha", IntOp::Eq, 1)?);
        let beta = QueryParams::new().filter(reopened.int_filter("beta", IntOp::Gt, 0)?);
        assert_eq!(count(&reopened, alpha)?.0, 1);
        assert_eq!(count(&reopened, beta)?.0, 2);
        assert_eq!(reopened.int_info("alpha").expect("alpha stats").count, 1);
        assert_eq!(reopened.int_info("beta").expect("beta stats").count, 1);
        Ok(())
    }

    fn crash_then_recover(stage: Stage) -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock = LockConfig::default()
            .lease(Duration::from_millis(20))
            .tries(40)
            .poll_interval(Duration::from_millis(2));
        let config = Arc::new(Config::new(temp_dir.path()).chunk_size(50).lock(lock));

        let table = Table::open("events", config.clone())?;
        ingest(&table, 0..30)?;
        table.digest()?;
        ingest(&table, 30..130)?;
        digest::run(&table, Some(stage))?;
        drop(table);
        std::thread::sleep(Duration::from_millis(40));

        let table = Table::open("events", config)?;
        table.digest()?;

        let mut query = QuerySpec::new(QueryParams::new().group(table.grouping("id")?).limit(1000));
        let stats = table.query(&table.load_spec(), &mut query)?;
        assert_eq!(stats.row_store_records, 0, "{:?}: log fully digested", stage);
        assert_eq!(query.results.cumulative.count, 130, "{:?}: every row once", stage);
        assert_eq!(query.results.results.len(), 130);
        assert!(query.results.results.values().all(|g| g.count == 1));
        Ok(())
    }

    #[test]
    fn test_crash_after_moving_logs() -> Result<()> {
        crash_then_recover(Stage::Moved)
    }

    #[test]
    fn test_crash_after_staging() -> Result<()> {
        crash_then_recover(Stage::Staged)
    }

    #[test]
    fn test_crash_after_commit() -> Result<()> {
        crash_then_recover(Stage::Committed)
    }

    #[test]
    fn test_restore_undigested() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = open(Config::new(temp_dir.path()))?;
        assert_eq!(table.restore_undigested()?, 0);

        ingest(&table, 0..10)?;
        let stomache = table.dir().join("stomache0000beef");
        fs::create_dir_all(&stomache)?;
        for log in row_store::log_files(&table.dir().join(row_store::INGEST_DIR))? {
            fs::rename(&log, stomache.join(io::dir_name(&log)))?;
        }
        assert_eq!(count(&table, QueryParams::new())?.0, 0, "Rows are in flight");

        assert_eq!(table.restore_undigested()?, 1);
        assert!(!stomache.exists());
        assert_eq!(count(&table, QueryParams::new())?.0, 10);
        Ok(())
    }
}
