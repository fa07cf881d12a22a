//! Query execution over a table's blocks.
//!
//! Blocks are pruned from their persisted stats, then loaded, filtered and
//! aggregated in parallel batches of `chunks_before_gc`. Each batch is
//! folded into the running total before the next one starts. Sampling
//! queries walk blocks newest first, one at a time, and stop as soon as
//! enough rows matched.

use rayon::prelude::*;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::block::{self, BlockLoader, TableBlock};
use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::query::{merge, QueryParams, QueryResults, QuerySpec, Scanner};
use crate::record::{FieldId, FieldType, Value};
use crate::table::info::{self, IntInfo, SavedColumnInfo};
use crate::table::keys::KeyTable;
use crate::table::{io as table_io, query_cache, row_store, Table};

/// Which columns a query materializes, and how loaded blocks are handled.
#[derive(Debug, Clone)]
pub struct LoadSpec {
    keys: KeyTable,
    fields: BTreeSet<FieldId>,
    read_row_store: bool,
    recycle_mem: bool,
    keep_blocks: bool,
}

impl LoadSpec {
    pub(crate) fn new(keys: KeyTable) -> Self {
        Self {
            keys,
            fields: BTreeSet::new(),
            read_row_store: true,
            recycle_mem: true,
            keep_blocks: false,
        }
    }

    fn column(mut self, name: &str, expected: FieldType) -> Result<Self> {
        let field = self
            .keys
            .id(name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))?;
        let actual = self.keys.field_type(field);
        if actual != expected {
            return Err(Error::ColumnTypeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        self.fields.insert(field);
        Ok(self)
    }

    pub fn int(self, name: &str) -> Result<Self> {
        self.column(name, FieldType::Int)
    }

    pub fn str(self, name: &str) -> Result<Self> {
        self.column(name, FieldType::Str)
    }

    pub fn set(self, name: &str) -> Result<Self> {
        self.column(name, FieldType::Set)
    }

    /// Load every known column.
    pub fn all(mut self) -> Self {
        let fields: Vec<FieldId> = self.keys.fields().map(|(id, _, _)| id).collect();
        self.fields.extend(fields);
        self
    }

    /// Include rows still sitting in the ingest log (default: true)
    pub fn read_row_store(mut self, enabled: bool) -> Self {
        self.read_row_store = enabled;
        self
    }

    /// Return full blocks' record arrays to the table's pool (default: true)
    pub fn recycle_mem(mut self, enabled: bool) -> Self {
        self.recycle_mem = enabled;
        self
    }

    /// Keep loaded blocks on the table for inspection (default: false)
    pub fn keep_blocks(mut self, enabled: bool) -> Self {
        self.keep_blocks = enabled;
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.fields.iter().copied()
    }

    /// Projected fields plus every field the query reads.
    fn projection(&self, params: &QueryParams) -> Vec<FieldId> {
        let mut fields = self.fields.clone();
        fields.extend(params.filters.iter().map(|f| f.field()));
        fields.extend(params.groups.iter().map(|g| g.field));
        fields.extend(params.aggregations.iter().map(|a| a.field));
        fields.extend(params.time_bucket.iter().map(|t| t.field));
        fields.extend(params.weight.iter().map(|w| w.field));
        fields.into_iter().collect()
    }
}

/// What happened while answering a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    /// Column blocks on disk when the query started
    pub blocks: usize,
    pub scanned: usize,
    /// Served from the query cache
    pub cached: usize,
    /// Pruned from stats, or incomplete
    pub skipped: usize,
    /// Blocks that failed to decode and were set aside
    pub broken: Vec<String>,
    pub row_store_records: usize,
}

enum Outcome {
    Scanned(QueryResults, Option<TableBlock>),
    Cached(QueryResults),
    Skipped,
    Broken(PathBuf),
}

/// Read-only state shared by every block of one query.
struct Plan<'a> {
    table: &'a Table,
    params: &'a QueryParams,
    regexes: Vec<Option<Regex>>,
    keys: KeyTable,
    int_info: BTreeMap<FieldId, IntInfo>,
    infos: HashMap<String, SavedColumnInfo>,
    fields: Vec<FieldId>,
    spec: &'a LoadSpec,
}

impl<'a> Plan<'a> {
    fn scanner(&self) -> Scanner<'_> {
        Scanner {
            params: self.params,
            regexes: &self.regexes,
            int_info: &self.int_info,
            keys: &self.keys,
            num_buckets: self.table.config.num_buckets,
            max_groups: self.table.config.internal_result_limit,
        }
    }

    fn block_info(&self, dir: &Path) -> Result<SavedColumnInfo> {
        match self.infos.get(&table_io::dir_name(dir)) {
            Some(info) => Ok(info.clone()),
            None => block::load_info(dir),
        }
    }

    fn use_cache(&self, info: &SavedColumnInfo) -> bool {
        let config = &self.table.config;
        (self.params.cache_queries || config.cache_queries)
            && !self.params.samples
            && info.num_records == config.chunk_size
    }

    fn run_block(&self, dir: &Path) -> Outcome {
        let info = match self.block_info(dir) {
            Ok(info) => info,
            Err(Error::Corrupted(msg)) => {
                warn!(block = %dir.display(), error = %msg, "unreadable block info");
                return Outcome::Broken(dir.to_path_buf());
            }
            Err(e) => {
                debug!(block = %dir.display(), error = %e, "skipping incomplete block");
                return Outcome::Skipped;
            }
        };

        if !self.params.filters.iter().all(|f| f.may_match(&info)) {
            return Outcome::Skipped;
        }

        let cache_key = if self.use_cache(&info) {
            match self.params.cache_key(&info, self.table.config.num_buckets) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(block = %dir.display(), error = %e, "failed to compute cache key");
                    None
                }
            }
        } else {
            None
        };
        if let Some(cached) = cache_key
            .as_deref()
            .and_then(|key| query_cache::load(dir, key))
        {
            return Outcome::Cached(cached);
        }

        let loader = BlockLoader {
            config: &self.table.config,
            keys: &self.keys,
            replacements: &self.table.replacements,
            pool: self.spec.recycle_mem.then_some(&self.table.pool),
        };
        let mut block = match loader.load(dir, &self.fields) {
            Ok(block) => block,
            Err(e @ (Error::Corrupted(_) | Error::RecordCountMismatch { .. })) => {
                warn!(block = %dir.display(), error = %e, "block failed to decode");
                return Outcome::Broken(dir.to_path_buf());
            }
            Err(Error::ReadError(_, e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!(block = %dir.display(), "block disappeared during query");
                return Outcome::Skipped;
            }
            Err(e) => {
                warn!(block = %dir.display(), error = %e, "failed to load block");
                return Outcome::Skipped;
            }
        };

        let results = self.scanner().scan(&mut block);
        if let Some(key) = &cache_key {
            query_cache::try_save(dir, key, &results);
        }

        if self.spec.keep_blocks {
            return Outcome::Scanned(results, Some(block));
        }
        if self.spec.recycle_mem && block.len() == self.table.config.chunk_size {
            self.table.pool.give_back(std::mem::take(&mut block.records));
        }
        Outcome::Scanned(results, None)
    }

    /// Scan the ingest log as one in-memory block.
    fn run_row_store(&self) -> Result<(QueryResults, usize)> {
        let rows = row_store::read_all(&self.table.dir)?;
        if rows.is_empty() {
            return Ok((QueryResults::new(), 0));
        }

        let mut keys = self.keys.clone();
        let mut block = TableBlock::new(self.table.dir.join(row_store::INGEST_DIR), &self.table.config);
        for row in &rows {
            block.push_row(row, &mut keys);
        }

        // Columns no block has seen yet get histogram ranges from the log
        let mut int_info = self.int_info.clone();
        for row in &rows {
            for (name, value) in &row.fields {
                let (Some(field), Value::Int(v)) = (keys.id(name), value) else {
                    continue;
                };
                if !self.int_info.contains_key(&field) {
                    info::fold_int(&mut int_info, field, *v, false);
                }
            }
        }

        let scanner = Scanner {
            keys: &keys,
            int_info: &int_info,
            ..self.scanner()
        };
        Ok((scanner.scan(&mut block), rows.len()))
    }
}

/// Collects outcomes into the running result.
struct Tally<'a> {
    stats: &'a mut QueryStats,
    results: QueryResults,
    kept: Vec<TableBlock>,
    broken: Vec<PathBuf>,
}

impl Tally<'_> {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Scanned(results, block) => {
                self.stats.scanned += 1;
                merge::combine(&mut self.results, results);
                self.kept.extend(block);
            }
            Outcome::Cached(results) => {
                self.stats.cached += 1;
                merge::combine(&mut self.results, results);
            }
            Outcome::Skipped => self.stats.skipped += 1,
            Outcome::Broken(dir) => {
                self.stats.broken.push(table_io::dir_name(&dir));
                self.broken.push(dir);
            }
        }
    }

    fn enough_samples(&self, params: &QueryParams) -> bool {
        params.samples && self.results.matched.len() >= params.limit
    }
}

/// Block infos from the table's cache files, plus any full block the cache
/// has not seen yet. Cache trouble only costs a re-read.
fn cached_block_infos(table: &Table, blocks: &[PathBuf]) -> HashMap<String, SavedColumnInfo> {
    let mut infos = table_io::load_block_infos(&table.dir).unwrap_or_else(|e| {
        warn!(table = %table.name, error = %e, "failed to read block info cache");
        HashMap::new()
    });

    let mut added = 0;
    for dir in blocks {
        let name = table_io::dir_name(dir);
        if infos.contains_key(&name) {
            continue;
        }
        if let Ok(info) = block::load_info(dir) {
            if info.num_records == table.config.chunk_size {
                infos.insert(name, info);
                added += 1;
            }
        }
    }
    if added == 0 {
        return infos;
    }

    let live: BTreeSet<String> = blocks.iter().map(|dir| table_io::dir_name(dir)).collect();
    let saved: BTreeMap<String, SavedColumnInfo> = infos
        .iter()
        .filter(|(name, _)| live.contains(*name))
        .map(|(name, info)| (name.clone(), info.clone()))
        .collect();
    let result = table.grab_lock(LockKind::Cache).and_then(|_guard| {
        table_io::save_block_infos(&table.dir, &saved, table.config.compress)
    });
    match result {
        Ok(()) => debug!(table = %table.name, added, "updated block info cache"),
        Err(e) => warn!(table = %table.name, error = %e, "failed to update block info cache"),
    }
    infos
}

pub(crate) fn execute(table: &Table, spec: &LoadSpec, query: &mut QuerySpec) -> Result<QueryStats> {
    let params = &query.params;
    let regexes = params.compile_regexes()?;
    let (keys, int_info) = {
        let state = table.state.read();
        (state.keys.clone(), state.int_info.clone())
    };

    let broken_names = table.broken_blocks();
    let blocks: Vec<PathBuf> = table_io::list_blocks(&table.dir)?
        .into_iter()
        .filter(|dir| !broken_names.contains(&table_io::dir_name(dir)))
        .collect();
    let infos = if table.config.cache_block_info {
        cached_block_infos(table, &blocks)
    } else {
        HashMap::new()
    };

    let plan = Plan {
        table,
        params,
        regexes,
        fields: spec.projection(params),
        keys,
        int_info,
        infos,
        spec,
    };

    let mut stats = QueryStats {
        blocks: blocks.len(),
        ..Default::default()
    };
    let mut tally = Tally {
        stats: &mut stats,
        results: QueryResults::new(),
        kept: Vec::new(),
        broken: Vec::new(),
    };

    // Undigested rows are newer than any block, so they come first for
    // sampling too
    if spec.read_row_store {
        let (results, count) = plan.run_row_store()?;
        tally.stats.row_store_records = count;
        merge::combine(&mut tally.results, results);
    }

    if params.samples {
        for dir in blocks.iter().rev() {
            if tally.enough_samples(params) {
                break;
            }
            tally.record(plan.run_block(dir));
        }
    } else {
        for batch in blocks.chunks(table.config.chunks_before_gc.max(1)) {
            let outcomes: Vec<Outcome> = batch.par_iter().map(|dir| plan.run_block(dir)).collect();
            for outcome in outcomes {
                tally.record(outcome);
            }
        }
    }

    let Tally {
        results,
        kept,
        broken,
        ..
    } = tally;
    for dir in &broken {
        table.mark_broken(dir);
    }
    if !kept.is_empty() {
        table.loaded.lock().extend(kept);
    }

    query.results = results;
    merge::sort_results(&mut query.results, &query.params);

    info!(
        table = %table.name,
        blocks = stats.blocks,
        scanned = stats.scanned,
        cached = stats.cached,
        skipped = stats.skipped,
        broken = stats.broken.len(),
        "query finished"
    );
    Ok(stats)
}
