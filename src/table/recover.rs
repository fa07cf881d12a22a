//! Recovery for broken locks. Each lock kind knows how to bring the files
//! it guards back to a consistent state after its holder died.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::block;
use crate::encoding::file;
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockKind};
use crate::table::digest::{self, DigestPlan, PLAN_FILE};
use crate::table::info::{SavedColumnInfo, TableMeta};
use crate::table::io::{self as table_io, INFO_BACKUP, INFO_FILE, INFO_FLAG, STOMACHE_PREFIX};
use crate::table::Table;

/// Runs right after `guard` took over the broken lock of `kind`.
pub(crate) fn recover(table: &Table, kind: &LockKind, guard: &LockGuard) -> Result<()> {
    info!(table = %table.name, lock = kind.name(), "recovering broken lock");
    match kind {
        LockKind::Info => recover_info(&table.dir, &table.name),
        LockKind::Digest => recover_stomaches(table, guard).map(|_| ()),
        LockKind::Block(name) => recover_block(&table.dir, name),
        LockKind::Cache => recover_cache(&table.dir),
    }
}

/// Make sure `info.db` decodes, restoring it from the backup if needed.
fn recover_info(dir: &Path, table: &str) -> Result<()> {
    let current = dir.join(INFO_FILE);
    if file::read_file::<TableMeta>(&current).is_ok() {
        return Ok(());
    }

    let backup = dir.join(INFO_BACKUP);
    if file::read_file::<TableMeta>(&backup).is_ok() {
        info!(table, "restoring table info from backup");
        fs::copy(&backup, &current).map_err(|e| Error::WriteError(current.display().to_string(), e))?;
        return Ok(());
    }

    if dir.join(INFO_FLAG).exists() {
        warn!(table, "neither table info nor its backup is readable");
        return Err(Error::InfoMissing(table.to_string()));
    }
    Ok(())
}

/// Finish or undo every digestion left behind in a stomache. `guard` is the
/// digest lock. Returns how many were handled.
pub(crate) fn recover_stomaches(table: &Table, guard: &LockGuard) -> Result<usize> {
    let mut handled = 0;
    let entries = match fs::read_dir(&table.dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(0),
    };

    let mut stomaches: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(STOMACHE_PREFIX)
        })
        .map(|entry| entry.path())
        .collect();
    stomaches.sort();

    for stomache in stomaches {
        let plan_path = stomache.join(PLAN_FILE);
        let plan = if plan_path.exists() {
            match file::read_file::<DigestPlan>(&plan_path) {
                Ok(plan) => Some(plan),
                Err(e) => {
                    warn!(table = %table.name, error = %e, "unreadable digest plan");
                    None
                }
            }
        } else {
            None
        };

        match plan {
            Some(plan) => roll_forward(table, guard, &stomache, plan)?,
            None => {
                let restored = digest::restore_logs(table, &stomache)?;
                fs::remove_dir_all(&stomache)
                    .map_err(|e| Error::WriteError(stomache.display().to_string(), e))?;
                info!(
                    table = %table.name,
                    stomache = %stomache.display(),
                    files = restored,
                    "restored undigested log files"
                );
            }
        }
        handled += 1;
    }
    Ok(handled)
}

fn roll_forward(table: &Table, guard: &LockGuard, stomache: &Path, plan: DigestPlan) -> Result<()> {
    digest::finish(table, guard, stomache, &plan)?;

    let mut state = table.state.write();
    // The plan's stats use the field IDs the digestion saved before
    // committing, which may have been another process. Adopt those first.
    if let Some(saved) = table_io::load_meta(&table.dir, &table.name)? {
        state.merge_saved(&saved, false);
    }
    state.int_info = plan.int_info;
    state.str_info = plan.str_info;
    table.save_info(&mut state, true)?;

    info!(
        table = %table.name,
        stomache = %stomache.display(),
        blocks = plan.blocks.len(),
        "rolled digestion forward"
    );
    Ok(())
}

/// Settle a block whose replacement was being swapped in: a readable
/// `.partial` is promoted, anything else is set aside as `.broke`.
fn recover_block(dir: &Path, name: &str) -> Result<()> {
    let final_dir = dir.join(name);
    let partial = table_io::with_suffix(&final_dir, ".partial");
    let old = table_io::with_suffix(&final_dir, ".old");

    if partial.exists() {
        match block::load_info(&partial) {
            Ok(info) if info.num_records > 0 => {
                info!(block = %final_dir.display(), "promoting recovered block");
                return digest::swap_in(&partial, &final_dir, &old);
            }
            _ => {
                let broke = table_io::with_suffix(&final_dir, ".partial.broke");
                warn!(block = %final_dir.display(), "discarding unreadable replacement block");
                if broke.exists() {
                    let _ = fs::remove_dir_all(&broke);
                }
                fs::rename(&partial, &broke)
                    .map_err(|e| Error::WriteError(broke.display().to_string(), e))?;
            }
        }
    }

    if !final_dir.exists() && old.exists() {
        fs::rename(&old, &final_dir)
            .map_err(|e| Error::WriteError(final_dir.display().to_string(), e))?;
    }
    Ok(())
}

/// Drop block info cache files that no longer decode.
fn recover_cache(dir: &Path) -> Result<()> {
    for path in table_io::info_cache_files(dir)? {
        if file::read_file::<BTreeMap<String, SavedColumnInfo>>(&path).is_err() {
            warn!(file = %path.display(), "deleting unreadable cache file");
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
