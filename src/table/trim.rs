//! Selecting the oldest blocks of a table for removal.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::block;
use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::table::io as table_io;
use crate::table::Table;

const MB: u64 = 1024 * 1024;

/// Which blocks to trim. Blocks are ranked newest first by the maximum of
/// the time column; a block is trimmed once the blocks ranked before it
/// use up the size budget, or when it ends before the cutoff.
#[derive(Debug, Clone, Default)]
pub struct TrimSpec {
    pub mb_limit: Option<u64>,
    pub delete_before: Option<i64>,
    /// Remove trimmed blocks instead of only listing them
    pub delete: bool,
}

impl TrimSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mb_limit(mut self, mb: u64) -> Self {
        self.mb_limit = Some(mb);
        self
    }

    pub fn delete_before(mut self, time: i64) -> Self {
        self.delete_before = Some(time);
        self
    }

    pub fn delete(mut self, enabled: bool) -> Self {
        self.delete = enabled;
        self
    }
}

fn dir_size(dir: &Path) -> u64 {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.metadata().ok())
                .filter(|meta| meta.is_file())
                .map(|meta| meta.len())
                .sum()
        })
        .unwrap_or(0)
}

pub(crate) fn trim(table: &Table, spec: &TrimSpec) -> Result<Vec<PathBuf>> {
    let time = table.config.time_column.as_deref().ok_or_else(|| {
        Error::InvalidOperation(format!("table {} has no time column to trim by", table.name))
    })?;

    let mut ranked = Vec::new();
    for dir in table_io::list_blocks(&table.dir)? {
        match block::load_info(&dir) {
            Ok(info) => {
                let max = info.int_info.get(time).map(|i| i.max).unwrap_or(i64::MIN);
                ranked.push((max, dir_size(&dir), dir));
            }
            Err(e) => warn!(block = %dir.display(), error = %e, "not trimming unreadable block"),
        }
    }
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.2.cmp(&a.2)));

    let budget = spec.mb_limit.map(|mb| mb.saturating_mul(MB));
    let mut used = 0u64;
    let mut trimmed = Vec::new();
    for (max, size, dir) in ranked {
        used += size;
        let over_budget = budget.is_some_and(|budget| used > budget);
        let too_old = spec.delete_before.is_some_and(|cutoff| max < cutoff);
        if over_budget || too_old {
            trimmed.push(dir);
        }
    }

    if spec.delete {
        for dir in &trimmed {
            let _guard = table.grab_lock(LockKind::Block(table_io::dir_name(dir)))?;
            fs::remove_dir_all(dir).map_err(|e| Error::WriteError(dir.display().to_string(), e))?;
        }
    }
    info!(table = %table.name, blocks = trimmed.len(), deleted = spec.delete, "trimmed table");
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::Row;
    use crate::tmpfs::TempDir;
    use std::sync::Arc;

    fn table(dir: &Path, time_column: Option<&str>) -> Result<Table> {
        let mut config = Config::new(dir).chunk_size(10);
        if let Some(column) = time_column {
            config = config.time_column(column);
        }
        let table = Table::open("logs", Arc::new(config))?;
        for t in 0..40 {
            table.add_record(Row::new().int("time", t).str("msg", "hello"));
        }
        table.flush()?;
        table.digest()?;
        Ok(table)
    }

    #[test]
    fn test_trim_needs_time_column() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = table(temp_dir.path(), None)?;
        assert!(matches!(
            table.trim(&TrimSpec::new().mb_limit(1)),
            Err(Error::InvalidOperation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_trim_by_cutoff() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = table(temp_dir.path(), Some("time"))?;
        assert_eq!(table.block_dirs()?.len(), 4);

        // Blocks ending at 9 and 19 are older than the cutoff
        let listed = table.trim(&TrimSpec::new().delete_before(20))?;
        assert_eq!(listed.len(), 2);
        assert_eq!(table.block_dirs()?.len(), 4, "Listing deletes nothing");

        let deleted = table.trim(&TrimSpec::new().delete_before(20).delete(true))?;
        assert_eq!(deleted, listed);
        assert_eq!(table.block_dirs()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_trim_by_size() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let table = table(temp_dir.path(), Some("time"))?;

        assert!(table.trim(&TrimSpec::new().mb_limit(1))?.is_empty());
        assert_eq!(table.trim(&TrimSpec::new().mb_limit(0))?.len(), 4);
        Ok(())
    }
}
