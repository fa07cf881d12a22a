//! Table directory layout: metadata files, block naming and listing, and
//! the table-level block info cache.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::encoding::file;
use crate::error::{Error, Result};
use crate::table::info::{SavedColumnInfo, TableMeta};
use crate::table::row_store::{INGEST_DIR, INGEST_TEMP_DIR};

pub const INFO_FILE: &str = "info.db";
pub const INFO_BACKUP: &str = "info.bak";
pub const INFO_FLAG: &str = "info.db.exists";
pub const CACHE_DIR: &str = "cache";
pub const STOMACHE_PREFIX: &str = "stomache";

/// Blocks per block info cache file.
pub const INFO_CACHE_BLOCKS: usize = 64;

const SKIPPED_SUFFIXES: [&str; 7] = ["old", "broken", "broke", "lock", "export", "partial", ".tmp"];

/// Load table metadata from `info.db`, falling back to `info.bak`.
///
/// Returns `None` for a table that never saved any. Fails with
/// [`Error::InfoMissing`] when the flag file says metadata was written but
/// neither copy decodes.
pub fn load_meta(table_dir: &Path, table: &str) -> Result<Option<TableMeta>> {
    for name in [INFO_FILE, INFO_BACKUP] {
        let path = table_dir.join(name);
        if file::resolve(&path).is_none() {
            continue;
        }
        match file::read_file::<TableMeta>(&path) {
            Ok(meta) => return Ok(Some(meta)),
            Err(e) => warn!(table, file = %path.display(), error = %e, "unreadable table info"),
        }
    }

    if table_dir.join(INFO_FLAG).exists() {
        return Err(Error::InfoMissing(table.to_string()));
    }
    Ok(None)
}

/// Persist table metadata: back up the current `info.db`, atomically write
/// the new one and touch the flag file.
pub fn save_meta(table_dir: &Path, meta: &TableMeta) -> Result<()> {
    fs::create_dir_all(table_dir)
        .map_err(|e| Error::WriteError(table_dir.display().to_string(), e))?;

    let current = table_dir.join(INFO_FILE);
    let flag = table_dir.join(INFO_FLAG);
    if meta.key_table.is_empty() && flag.exists() {
        return Err(Error::InfoMissing(meta.name.clone()));
    }

    if current.exists() {
        let backup = table_dir.join(INFO_BACKUP);
        if let Err(e) = fs::copy(&current, &backup) {
            warn!(table = %meta.name, error = %e, "failed to back up table info");
        }
    }

    file::write_file(&current, meta, false)?;
    fs::write(&flag, b"").map_err(|e| Error::WriteError(flag.display().to_string(), e))?;
    debug!(table = %meta.name, fields = meta.key_table.len(), "saved table info");
    Ok(())
}

/// A fresh block directory path. Names sort in creation order.
pub fn new_block_dir(table_dir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    table_dir.join(format!("block{:016x}_{:08x}", nanos, rand::random::<u32>()))
}

/// Whether a directory entry name can be a column block.
pub fn is_block_name(name: &str) -> bool {
    if name.is_empty()
        || name == INGEST_DIR
        || name == INGEST_TEMP_DIR
        || name == CACHE_DIR
        || name.starts_with(STOMACHE_PREFIX)
        || name.starts_with('.')
        || name.contains(INFO_FILE)
    {
        return false;
    }
    !SKIPPED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Every column block of the table, oldest first.
pub fn list_blocks(table_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(table_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::ReadError(table_dir.display().to_string(), e)),
    };

    let mut blocks = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() && is_block_name(&name) {
            blocks.push(entry.path());
        }
    }
    blocks.sort();
    Ok(blocks)
}

pub fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Append `suffix` to a path's final component.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn info_cache_files(table_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = table_dir.join(CACHE_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::ReadError(dir.display().to_string(), e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let name = dir_name(&path);
        if name.starts_with("info") && file::base_name(&name).ends_with(".db") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Cached block infos by block name. Unreadable cache files are skipped.
pub fn load_block_infos(table_dir: &Path) -> Result<HashMap<String, SavedColumnInfo>> {
    let mut infos = HashMap::new();
    for path in info_cache_files(table_dir)? {
        match file::read_file::<BTreeMap<String, SavedColumnInfo>>(&path) {
            Ok(chunk) => infos.extend(chunk),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping block info cache file"),
        }
    }
    Ok(infos)
}

/// Rewrite the block info cache. Callers hold the cache lock.
pub fn save_block_infos(
    table_dir: &Path,
    infos: &BTreeMap<String, SavedColumnInfo>,
    compress: bool,
) -> Result<()> {
    let dir = table_dir.join(CACHE_DIR);
    fs::create_dir_all(&dir).map_err(|e| Error::WriteError(dir.display().to_string(), e))?;

    let entries: Vec<_> = infos.iter().collect();
    let mut written = Vec::new();
    for (idx, chunk) in entries.chunks(INFO_CACHE_BLOCKS).enumerate() {
        let chunk: BTreeMap<&String, &SavedColumnInfo> = chunk.iter().copied().collect();
        written.push(file::write_file(
            &dir.join(format!("info{:05}.db", idx)),
            &chunk,
            compress,
        )?);
    }

    for stale in info_cache_files(table_dir)? {
        if !written.contains(&stale) {
            let _ = fs::remove_file(&stale);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn meta(name: &str, fields: &[&str]) -> TableMeta {
        TableMeta {
            name: name.to_string(),
            key_table: fields
                .iter()
                .enumerate()
                .map(|(i, f)| (f.to_string(), i as i16))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_meta_backup_and_fallback() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path();
        assert!(load_meta(dir, "t")?.is_none());

        save_meta(dir, &meta("t", &["age"]))?;
        save_meta(dir, &meta("t", &["age", "host"]))?;
        assert!(dir.join(INFO_FLAG).exists());

        // The backup holds the previous version
        let backup: TableMeta = file::read_file(&dir.join(INFO_BACKUP))?;
        assert_eq!(backup.key_table.len(), 1);

        fs::write(dir.join(INFO_FILE), b"torn")?;
        let loaded = load_meta(dir, "t")?.expect("Backup should load");
        assert_eq!(loaded.key_table.len(), 1);

        fs::write(dir.join(INFO_BACKUP), b"torn")?;
        assert!(matches!(load_meta(dir, "t"), Err(Error::InfoMissing(_))));

        // An empty key table never replaces existing info
        assert!(matches!(
            save_meta(dir, &meta("t", &[])),
            Err(Error::InfoMissing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_block_listing() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path();

        let first = new_block_dir(dir);
        fs::create_dir_all(&first)?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = new_block_dir(dir);
        fs::create_dir_all(&second)?;

        for skipped in [
            "ingest",
            ".ingest.temp",
            "cache",
            "stomache1234",
            "block1.partial",
            "block2.old",
            "block3.broke",
            "block4.broken",
            "block5.export",
        ] {
            fs::create_dir_all(dir.join(skipped))?;
        }
        fs::write(dir.join("info.db"), b"")?;
        fs::write(dir.join("block6.lock"), b"")?;

        assert_eq!(list_blocks(dir)?, vec![first, second]);
        Ok(())
    }

    #[test]
    fn test_block_info_cache() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path();

        let infos: BTreeMap<String, SavedColumnInfo> = (0..150)
            .map(|i| {
                (
                    format!("block{:04}", i),
                    SavedColumnInfo {
                        num_records: i,
                        ..Default::default()
                    },
                )
            })
            .collect();
        save_block_infos(dir, &infos, true)?;
        assert_eq!(info_cache_files(dir)?.len(), 3);

        let loaded = load_block_infos(dir)?;
        assert_eq!(loaded.len(), 150);
        assert_eq!(loaded["block0149"].num_records, 149);

        // Shrinking drops the stale files
        let few: BTreeMap<_, _> = infos.into_iter().take(10).collect();
        save_block_infos(dir, &few, false)?;
        assert_eq!(info_cache_files(dir)?.len(), 1);
        assert_eq!(load_block_infos(dir)?.len(), 10);
        Ok(())
    }
}
