//! The row-store log: self-contained batch files under `<table>/ingest/`.
//!
//! A batch is written into `.ingest.temp/` first and renamed into the log,
//! so readers only ever see complete files. Each file is a fixed header
//! followed by the bincode-encoded rows:
//!
//! ```text
//! +-------+---------+-------+-------------+----------+---------+
//! | magic | version | count | payload len | checksum | payload |
//! | 4B    | 2B      | 8B    | 8B          | 8B       | ...     |
//! +-------+---------+-------+-------------+----------+---------+
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::encoding::bincode;
use crate::error::{Error, Result};
use crate::hasher;
use crate::record::Row;

pub const INGEST_DIR: &str = "ingest";
pub const INGEST_TEMP_DIR: &str = ".ingest.temp";

pub const LOG_MAGIC: [u8; 4] = *b"ROWS";
pub const LOG_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 30;

const RENAME_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u16,
    pub count: u64,
    pub payload_len: u64,
    pub checksum: u64,
}

impl LogHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.extend_from_slice(&LOG_MAGIC);
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u64::<BigEndian>(self.count)?;
        buf.write_u64::<BigEndian>(self.payload_len)?;
        buf.write_u64::<BigEndian>(self.checksum)
    }
}

impl TryFrom<&[u8]> for LogHeader {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "log header truncated at {} bytes",
                bytes.len()
            )));
        }
        if bytes[..4] != LOG_MAGIC {
            return Err(Error::Corrupted("bad log magic".to_string()));
        }

        let mut reader = &bytes[4..HEADER_SIZE];
        let field = |e: io::Error| Error::Corrupted(format!("log header: {}", e));
        let header = LogHeader {
            version: reader.read_u16::<BigEndian>().map_err(field)?,
            count: reader.read_u64::<BigEndian>().map_err(field)?,
            payload_len: reader.read_u64::<BigEndian>().map_err(field)?,
            checksum: reader.read_u64::<BigEndian>().map_err(field)?,
        };
        if header.version != LOG_VERSION {
            return Err(Error::Corrupted(format!(
                "unsupported log version {}",
                header.version
            )));
        }
        Ok(header)
    }
}

/// Frame a batch of rows.
pub fn encode_batch(rows: &[Row]) -> Result<Vec<u8>> {
    let payload = bincode::serialize(&rows)?;
    let header = LogHeader {
        version: LOG_VERSION,
        count: rows.len() as u64,
        payload_len: payload.len() as u64,
        checksum: hasher::checksum(&payload),
    };

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed batch, validating length, checksum and record count.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Row>> {
    let header = LogHeader::try_from(bytes)?;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() as u64 != header.payload_len {
        return Err(Error::Corrupted(format!(
            "log payload is {} bytes, header says {}",
            payload.len(),
            header.payload_len
        )));
    }
    if hasher::checksum(payload) != header.checksum {
        return Err(Error::Corrupted("log checksum mismatch".to_string()));
    }

    let rows: Vec<Row> = bincode::deserialize(payload)?;
    if rows.len() as u64 != header.count {
        return Err(Error::RecordCountMismatch {
            expected: header.count as usize,
            actual: rows.len(),
        });
    }
    Ok(rows)
}

pub fn read_log_file(path: &Path) -> Result<Vec<Row>> {
    let bytes = fs::read(path).map_err(|e| Error::ReadError(path.display().to_string(), e))?;
    decode_batch(&bytes).map_err(|e| match e {
        Error::Corrupted(msg) => Error::Corrupted(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

fn log_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    format!("{:016x}_{:08x}.db", nanos, rand::random::<u32>())
}

/// Durably append `rows` to the table's log. Returns the new file.
pub fn append(table_dir: &Path, rows: &[Row]) -> Result<PathBuf> {
    let temp_dir = table_dir.join(INGEST_TEMP_DIR);
    let ingest_dir = table_dir.join(INGEST_DIR);
    for dir in [&temp_dir, &ingest_dir] {
        fs::create_dir_all(dir).map_err(|e| Error::WriteError(dir.display().to_string(), e))?;
    }

    let name = log_file_name();
    let staged = temp_dir.join(&name);
    fs::write(&staged, encode_batch(rows)?)
        .map_err(|e| Error::WriteError(staged.display().to_string(), e))?;

    let target = ingest_dir.join(&name);
    let mut last_err = None;
    for attempt in 0..RENAME_ATTEMPTS {
        match fs::rename(&staged, &target) {
            Ok(()) => {
                debug!(file = %target.display(), rows = rows.len(), "appended to row log");
                return Ok(target);
            }
            Err(e) => {
                warn!(file = %staged.display(), attempt, error = %e, "log rename failed");
                last_err = Some(e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    let _ = fs::remove_file(&staged);
    let err = last_err.unwrap_or_else(|| io::Error::other("rename failed"));
    Err(Error::WriteError(target.display().to_string(), err))
}

/// Log files in `dir`, oldest first.
pub fn log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::ReadError(dir.display().to_string(), e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_log = path.is_file()
            && path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(".db"))
                .unwrap_or(false);
        if is_log {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// File count and total bytes of the table's log.
pub fn log_stats(table_dir: &Path) -> Result<(usize, u64)> {
    let files = log_files(&table_dir.join(INGEST_DIR))?;
    let bytes = files
        .iter()
        .map(|f| fs::metadata(f).map(|m| m.len()).unwrap_or(0))
        .sum();
    Ok((files.len(), bytes))
}

/// Move an undecodable log file out of the way as `<table>/<file>.broken`.
pub fn quarantine(table_dir: &Path, path: &Path) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = table_dir.join(format!("{}.broken", name));
    if let Err(e) = fs::rename(path, &target) {
        warn!(file = %path.display(), error = %e, "failed to quarantine log file");
    }
}

/// Every row in the table's log. Corrupt files are quarantined and skipped.
pub fn read_all(table_dir: &Path) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for path in log_files(&table_dir.join(INGEST_DIR))? {
        match read_log_file(&path) {
            Ok(batch) => rows.extend(batch),
            // Renamed away by a concurrent digestion.
            Err(Error::ReadError(_, e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping broken log file");
                quarantine(table_dir, &path);
            }
        }
    }
    Ok(rows)
}
