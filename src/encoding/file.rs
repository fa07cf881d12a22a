//! Structured files on disk: bincode payloads, optionally zstd-compressed.
//!
//! A compressed file carries the `.zst` suffix. Readers accept either name:
//! asking for `int_age.db` opens `int_age.db` when present and otherwise
//! probes `int_age.db.zst`.

use super::{bincode, EncodingError};
use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const COMPRESSED_EXT: &str = ".zst";

const ZSTD_LEVEL: i32 = 3;

/// Encode a value, compressing the bincode payload when asked.
pub fn encode<T: Serialize>(value: &T, compress: bool) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(value)?;
    if !compress {
        return Ok(bytes);
    }
    zstd::encode_all(bytes.as_slice(), ZSTD_LEVEL)
        .map_err(|e| EncodingError::Compression(e.to_string()).into())
}

/// Decode a value produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8], compressed: bool) -> Result<T> {
    if !compressed {
        return bincode::deserialize(bytes);
    }
    let raw = zstd::decode_all(bytes).map_err(|e| EncodingError::Compression(e.to_string()))?;
    bincode::deserialize(&raw)
}

pub fn is_compressed(path: &Path) -> bool {
    path.to_string_lossy().ends_with(COMPRESSED_EXT)
}

/// Strip the compression suffix from a file name, if any.
pub fn base_name(name: &str) -> &str {
    name.strip_suffix(COMPRESSED_EXT).unwrap_or(name)
}

fn compressed_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(COMPRESSED_EXT);
    PathBuf::from(name)
}

/// Find the on-disk variant of `path`, plain or compressed.
pub fn resolve(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    if is_compressed(path) {
        return None;
    }
    let sibling = compressed_sibling(path);
    sibling.exists().then_some(sibling)
}

/// Read and decode a structured file, detecting compression by suffix or by
/// probing for a compressed sibling.
pub fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let actual = resolve(path).ok_or_else(|| {
        Error::ReadError(
            path.display().to_string(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        )
    })?;
    let bytes = fs::read(&actual).map_err(|e| Error::ReadError(actual.display().to_string(), e))?;
    decode(&bytes, is_compressed(&actual))
        .map_err(|e| Error::Corrupted(format!("{}: {}", actual.display(), e)))
}

/// Write a structured file atomically: the payload goes to a temp file in the
/// same directory which is then renamed into place. Returns the final path,
/// which carries the compression suffix when `compress` is set.
pub fn write_file<T: Serialize>(path: &Path, value: &T, compress: bool) -> Result<PathBuf> {
    let bytes = encode(value, compress)?;
    let target = if compress {
        compressed_sibling(path)
    } else {
        path.to_path_buf()
    };
    write_bytes(&target, &bytes)?;

    // Drop the other variant so readers never see a stale copy.
    let stale = if compress {
        path.to_path_buf()
    } else {
        compressed_sibling(path)
    };
    if stale.exists() {
        let _ = fs::remove_file(&stale);
    }

    Ok(target)
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidOperation(format!("{} has no parent", path.display())))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{}.tmp{:08x}", name, rand::random::<u32>()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(Error::WriteError(path.display().to_string(), e));
    }
    Ok(())
}
