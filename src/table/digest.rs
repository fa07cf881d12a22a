//! Digestion: turning the row-store log into column blocks.
//!
//! 1. Under the digest lock, log files are moved into a private
//!    `stomache*` directory.
//! 2. Their rows are replayed into blocks staged inside that directory,
//!    topping up the newest partial block first.
//! 3. A plan naming every staged block and its final name is written
//!    atomically. This is the commit point.
//! 4. Each staged block is promoted into the table, then the stomache is
//!    removed.
//!
//! Recovery rolls a stomache with a plan forward and puts the log files of
//! one without a plan back into `ingest/`, so every row is visible exactly
//! once.
//!
//! The digest lease is renewed after every staged or promoted block and
//! right before the plan is written, so a digestion that is still making
//! progress is never mistaken for a dead one. Within one process,
//! digestions of a table also take turns on [`Table::digesting`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::block::{self, BlockLoader, TableBlock};
use crate::encoding::file;
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockKind};
use crate::record::{FieldId, Row, Value};
use crate::table::info::{self, IntInfo, StrInfo};
use crate::table::keys::KeyTable;
use crate::table::io::{self as table_io, STOMACHE_PREFIX};
use crate::table::{recover, row_store, Table, TableState};

pub const PLAN_FILE: &str = "plan.db";

/// Committed outcome of one digestion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestPlan {
    /// Log file names inside the stomache
    pub logs: Vec<String>,
    pub blocks: Vec<StagedBlock>,
    /// Table stats once every block is in place
    pub int_info: BTreeMap<FieldId, IntInfo>,
    pub str_info: BTreeMap<FieldId, StrInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedBlock {
    /// Directory name inside the stomache
    pub staged: String,
    /// Final block directory name in the table
    pub target: String,
}

/// Where a simulated crash stops a digestion.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Log files moved into the stomache
    Moved,
    /// Blocks staged, no plan yet
    Staged,
    /// Plan written, nothing promoted
    Committed,
}

pub(crate) fn digest(table: &Table) -> Result<usize> {
    run(table, None)
}

pub(crate) fn run(table: &Table, crash_after: Option<Stage>) -> Result<usize> {
    let _running = table.digesting.lock();
    let guard = table.grab_lock(LockKind::Digest)?;
    // Holding the lock, any stomache left behind belongs to a dead digestion.
    recover::recover_stomaches(table, &guard)?;

    let logs = row_store::log_files(&table.dir.join(row_store::INGEST_DIR))?;
    if logs.is_empty() {
        return Ok(0);
    }

    let stomache = table
        .dir
        .join(format!("{}{:08x}", STOMACHE_PREFIX, rand::random::<u32>()));
    let moved = move_logs(table, &logs, &stomache)?;
    if crash_after == Some(Stage::Moved) {
        std::mem::forget(guard);
        return Ok(0);
    }

    let mut state = table.state.write();
    let staged = stage(table, &guard, &mut state, &stomache, moved).and_then(|(plan, count)| {
        if crash_after != Some(Stage::Staged) {
            // Last chance to find out the digestion was taken over
            guard.renew()?;
            file::write_file(&stomache.join(PLAN_FILE), &plan, false)?;
        }
        Ok((plan, count))
    });
    let (plan, count) = match staged {
        Ok(staged) => staged,
        Err(e) => {
            warn!(table = %table.name, error = %e, "digestion failed, restoring log");
            restore_logs(table, &stomache)?;
            let _ = fs::remove_dir_all(&stomache);
            return Err(e);
        }
    };
    if crash_after.is_some() {
        std::mem::forget(guard);
        return Ok(0);
    }

    finish(table, &guard, &stomache, &plan)?;
    let blocks = plan.blocks.len();
    state.int_info = plan.int_info;
    state.str_info = plan.str_info;
    table.save_info(&mut state, true)?;
    drop(state);

    info!(table = %table.name, records = count, blocks, "digested row log");
    drop(guard);
    Ok(count)
}

fn move_logs(table: &Table, logs: &[PathBuf], stomache: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(stomache)
        .map_err(|e| Error::WriteError(stomache.display().to_string(), e))?;

    let mut moved = Vec::new();
    for log in logs {
        let name = table_io::dir_name(log);
        match fs::rename(log, stomache.join(&name)) {
            Ok(()) => moved.push(name),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                restore_logs(table, stomache)?;
                let _ = fs::remove_dir_all(stomache);
                return Err(Error::WriteError(log.display().to_string(), e));
            }
        }
    }
    debug!(table = %table.name, files = moved.len(), stomache = %stomache.display(), "moved log into stomache");
    Ok(moved)
}

/// Replay the stomache's log files into staged blocks. New fields are
/// registered and saved to the table info before any stats are computed, so
/// the plan's field IDs agree with what other handles see.
fn stage(
    table: &Table,
    guard: &LockGuard,
    state: &mut TableState,
    stomache: &Path,
    moved: Vec<String>,
) -> Result<(DigestPlan, usize)> {
    let mut rows = Vec::new();
    let mut logs = Vec::new();
    for name in moved {
        let path = stomache.join(&name);
        match row_store::read_log_file(&path) {
            Ok(batch) => {
                rows.extend(batch);
                logs.push(name);
            }
            Err(e) => {
                warn!(table = %table.name, file = %path.display(), error = %e, "skipping broken log file");
                row_store::quarantine(&table.dir, &path);
            }
        }
    }
    if let Some(time) = table.config.time_column.as_deref() {
        rows.sort_by_key(|row| match row.get(time) {
            Some(Value::Int(t)) => (true, *t),
            _ => (false, 0),
        });
    }

    for row in &rows {
        for (name, value) in &row.fields {
            state.keys.get_or_insert(name, value.field_type());
        }
    }
    table.save_info(state, false)?;

    let count = rows.len();
    let mut keys = state.keys.clone();
    let mut int_info = state.int_info.clone();
    let mut str_info = state.str_info.clone();
    let chunk_size = table.config.chunk_size.max(1);

    let mut staged = Vec::new();
    let mut rows = rows.into_iter().peekable();
    let mut fill = open_partial(table, &keys)?;
    while rows.peek().is_some() {
        let (mut block, target) = match fill.take() {
            Some(partial) => partial,
            None => (
                TableBlock::new(PathBuf::new(), &table.config),
                table_io::dir_name(&table_io::new_block_dir(&table.dir)),
            ),
        };
        let name = format!("staged{:04}", staged.len());
        block.dir = stomache.join(&name);

        while block.len() < chunk_size {
            let Some(row) = rows.next() else {
                break;
            };
            block.push_row(&row, &mut keys);
            fold_row(&row, &keys, table.config.skip_outliers, &mut int_info, &mut str_info);
        }
        if let Some(field) = table.config.time_column.as_deref().and_then(|t| keys.id(t)) {
            block.sort_by_int(field);
        }

        block.save(&keys, &table.config)?;
        staged.push(StagedBlock {
            staged: name,
            target,
        });
        guard.renew()?;
    }
    str_info.values_mut().for_each(StrInfo::prune);

    let plan = DigestPlan {
        logs,
        blocks: staged,
        int_info,
        str_info,
    };
    Ok((plan, count))
}

/// Fold a newly columnized row into the table-wide stats. Rows already in
/// a topped-up block were counted when they were first digested.
fn fold_row(
    row: &Row,
    keys: &KeyTable,
    skip_outliers: bool,
    int_info: &mut BTreeMap<FieldId, IntInfo>,
    str_info: &mut BTreeMap<FieldId, StrInfo>,
) {
    for (name, value) in &row.fields {
        let Some(field) = keys.id(name) else {
            continue;
        };
        if keys.field_type(field) != value.field_type() {
            continue;
        }
        match value {
            Value::Int(v) => info::fold_int(int_info, field, *v, skip_outliers),
            Value::Str(s) => str_info.entry(field).or_default().update(s, 1),
            Value::Set(_) => {}
        }
    }
}

/// The newest block, loaded in full, when it still has room.
fn open_partial(
    table: &Table,
    keys: &KeyTable,
) -> Result<Option<(TableBlock, String)>> {
    let Some(newest) = table_io::list_blocks(&table.dir)?.pop() else {
        return Ok(None);
    };
    let name = table_io::dir_name(&newest);
    if table.broken_blocks().contains(&name) {
        return Ok(None);
    }
    match block::load_info(&newest) {
        Ok(info) if info.num_records < table.config.chunk_size => {}
        _ => return Ok(None),
    }

    let fields: Vec<FieldId> = keys.fields().map(|(id, _, _)| id).collect();
    let no_replacements = Default::default();
    let loader = BlockLoader {
        config: &table.config,
        keys,
        replacements: &no_replacements,
        pool: None,
    };
    match loader.load(&newest, &fields) {
        Ok(block) => Ok(Some((block, name))),
        Err(e) => {
            warn!(block = %newest.display(), error = %e, "not topping up unreadable block");
            Ok(None)
        }
    }
}

/// Promote every staged block of a committed plan, then drop the stomache.
/// Safe to repeat after a crash at any point. `guard` is the digest lock,
/// renewed as blocks go in.
pub(crate) fn finish(
    table: &Table,
    guard: &LockGuard,
    stomache: &Path,
    plan: &DigestPlan,
) -> Result<()> {
    for staged in &plan.blocks {
        promote(table, &stomache.join(&staged.staged), &staged.target)?;
        guard.renew()?;
    }
    fs::remove_dir_all(stomache)
        .map_err(|e| Error::WriteError(stomache.display().to_string(), e))?;
    Ok(())
}

/// Move a finished block into place as `target`, replacing any existing
/// block of that name.
fn promote(table: &Table, staged: &Path, target: &str) -> Result<()> {
    let _guard = table.grab_lock(LockKind::Block(target.to_string()))?;
    let final_dir = table.dir.join(target);
    let partial = table_io::with_suffix(&final_dir, ".partial");
    let old = table_io::with_suffix(&final_dir, ".old");

    if staged.exists() {
        if partial.exists() {
            let _ = fs::remove_dir_all(&partial);
        }
        fs::rename(staged, &partial)
            .map_err(|e| Error::WriteError(partial.display().to_string(), e))?;
    }
    if partial.exists() {
        swap_in(&partial, &final_dir, &old)?;
    }
    debug!(table = %table.name, block = target, "promoted block");
    Ok(())
}

/// Replace `final_dir` with `partial`, parking the previous version at `old`
/// until the new one is in place.
pub(crate) fn swap_in(partial: &Path, final_dir: &Path, old: &Path) -> Result<()> {
    let rename = |from: &Path, to: &Path| {
        fs::rename(from, to).map_err(|e| Error::WriteError(to.display().to_string(), e))
    };
    if final_dir.exists() {
        if old.exists() {
            let _ = fs::remove_dir_all(old);
        }
        rename(final_dir, old)?;
    }
    rename(partial, final_dir)?;
    if old.exists() {
        let _ = fs::remove_dir_all(old);
    }
    Ok(())
}

/// Move a stomache's log files back into `ingest/`. Returns how many.
pub(crate) fn restore_logs(table: &Table, stomache: &Path) -> Result<usize> {
    let ingest = table.dir.join(row_store::INGEST_DIR);
    fs::create_dir_all(&ingest).map_err(|e| Error::WriteError(ingest.display().to_string(), e))?;

    let mut restored = 0;
    for log in row_store::log_files(stomache)? {
        if table_io::dir_name(&log) == PLAN_FILE {
            continue;
        }
        let target = ingest.join(table_io::dir_name(&log));
        fs::rename(&log, &target).map_err(|e| Error::WriteError(target.display().to_string(), e))?;
        restored += 1;
    }
    Ok(restored)
}
