use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::encoding::file;
use crate::error::{Error, Result};
use crate::query::QueryResults;
use crate::table::io::CACHE_DIR;

fn entry_path(block_dir: &Path, key: &str) -> PathBuf {
    block_dir.join(CACHE_DIR).join(format!("{}.db", key))
}

/// Cached per-block results for `key`, if present and readable.
pub fn load(block_dir: &Path, key: &str) -> Option<QueryResults> {
    let path = entry_path(block_dir, key);
    file::resolve(&path)?;
    match file::read_file(&path) {
        Ok(results) => Some(results),
        Err(e) => {
            debug!(block = %block_dir.display(), key, error = %e, "unreadable cache entry");
            None
        }
    }
}

/// Persist one block's results. Always compressed.
pub fn save(block_dir: &Path, key: &str, results: &QueryResults) -> Result<()> {
    let dir = block_dir.join(CACHE_DIR);
    fs::create_dir_all(&dir).map_err(|e| Error::WriteError(dir.display().to_string(), e))?;
    file::write_file(&entry_path(block_dir, key), results, true)?;
    Ok(())
}

/// [`save`], treating failure as a miss.
pub fn try_save(block_dir: &Path, key: &str, results: &QueryResults) {
    if let Err(e) = save(block_dir, key, results) {
        warn!(block = %block_dir.display(), key, error = %e, "failed to write query cache");
    }
}
