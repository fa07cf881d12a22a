use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::encoding::file;
use crate::error::{Error, Result};

/// The coordination locks a table uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Table metadata (`info.db`)
    Info,
    /// Ingest log digestion
    Digest,
    /// Block info cache files
    Cache,
    /// One block directory, by basename
    Block(String),
}

impl LockKind {
    pub fn name(&self) -> &str {
        match self {
            LockKind::Info => "info",
            LockKind::Digest => "stomache",
            LockKind::Cache => "cache",
            LockKind::Block(name) => name,
        }
    }

    /// Lock file for this kind inside `table_dir`.
    pub fn path(&self, table_dir: &Path) -> PathBuf {
        table_dir.join(format!("{}.lock", self.name()))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Contents of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub pid: u32,
    pub token: u64,
    pub expires_at_ms: u64,
}

impl Lease {
    fn new(token: u64, lease: Duration) -> Self {
        Self {
            pid: std::process::id(),
            token,
            expires_at_ms: now_ms().saturating_add(lease.as_millis() as u64),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at_ms
    }

    fn encode(&self) -> String {
        format!("{} {} {}\n", self.pid, self.token, self.expires_at_ms)
    }

    fn parse(content: &str) -> Option<Self> {
        let mut parts = content.split_whitespace();
        let lease = Lease {
            pid: parts.next()?.parse().ok()?,
            token: parts.next()?.parse().ok()?,
            expires_at_ms: parts.next()?.parse().ok()?,
        };
        parts.next().is_none().then_some(lease)
    }
}

/// What a lock file currently says.
enum Observed {
    Free,
    Held(Lease),
    Unreadable,
}

fn observe(path: &Path) -> Result<Observed> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Lease::parse(&content).map_or(Observed::Unreadable, Observed::Held)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Observed::Free),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(Observed::Unreadable),
        Err(e) => Err(Error::ReadError(path.display().to_string(), e)),
    }
}

/// Create the lock file with its full contents in one step. The lease is
/// written to a private temp file which is then hard-linked into place, so
/// the lock never exists half-written.
fn try_create(path: &Path, lease: &Lease) -> Result<bool> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidOperation(format!("{} has no parent", path.display())))?;
    let temp = dir.join(format!(".lease{:016x}", lease.token));
    fs::write(&temp, lease.encode()).map_err(|e| Error::WriteError(temp.display().to_string(), e))?;

    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::WriteError(path.display().to_string(), e)),
    }
}

/// Create a fresh lease at `path` and confirm it is the one in place.
fn claim(path: &Path, config: &LockConfig) -> Result<Option<LockGuard>> {
    let lease = Lease::new(rand::random(), config.lease);
    if !try_create(path, &lease)? {
        return Ok(None);
    }
    // A takeover may have removed and re-created the file between our link
    // and now.
    match observe(path)? {
        Observed::Held(current) if current.token == lease.token => Ok(Some(LockGuard {
            path: path.to_path_buf(),
            token: lease.token,
            lease: config.lease,
            released: false,
        })),
        _ => Ok(None),
    }
}

/// Take the lock at `path`.
///
/// A live lease held by someone else is polled up to `tries` times before
/// giving up with [`Error::LockUnavailable`]. An expired lease, or a lock
/// file that stays unreadable for more than `max_breaks` observations, is
/// reported as [`Error::LockBroken`] carrying what was seen, so the caller
/// can [`steal`] it and run recovery.
pub fn grab(path: &Path, config: &LockConfig) -> Result<LockGuard> {
    let name = path.display().to_string();
    let mut breaks = 0;

    for attempt in 0..config.tries.max(1) {
        if let Some(guard) = claim(path, config)? {
            debug!(lock = %name, attempt, "lock acquired");
            return Ok(guard);
        }

        match observe(path)? {
            Observed::Free => continue,
            Observed::Held(held) if held.is_expired() => {
                warn!(lock = %name, pid = held.pid, "lock lease expired");
                return Err(Error::LockBroken {
                    name,
                    stale: Some(held.token),
                });
            }
            Observed::Held(_) => {}
            Observed::Unreadable => {
                breaks += 1;
                if breaks > config.max_breaks {
                    warn!(lock = %name, breaks, "lock file unreadable");
                    return Err(Error::LockBroken { name, stale: None });
                }
            }
        }
        thread::sleep(config.poll_interval);
    }

    Err(Error::LockUnavailable(name))
}

/// Take over a lock that [`grab`] reported broken.
///
/// `stale` is the token of the expired lease that was seen, or `None` for an
/// unreadable lock file. Takeovers of one lock are serialized through a
/// hidden `.<lock>.break` file. Holding it, the lock file is read again and
/// only removed if it still shows that broken lease, so a lease someone
/// took or renewed in the meantime survives. Returns `None` when the lock
/// was not ours to take, in which case the caller should [`grab`] again.
pub fn steal(path: &Path, stale: Option<u64>, config: &LockConfig) -> Result<Option<LockGuard>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidOperation(format!("{} has no file name", path.display())))?;
    let breaker_path = path.with_file_name(format!(".{}.break", file_name));

    let Some(breaker) = claim(&breaker_path, config)? else {
        // A takeover that died halfway leaves its breaker behind
        if let Observed::Held(held) = observe(&breaker_path)? {
            if held.is_expired() {
                warn!(lock = %breaker_path.display(), "clearing expired takeover");
                let _ = fs::remove_file(&breaker_path);
            }
        }
        return Ok(None);
    };

    let still_broken = match (observe(path)?, stale) {
        (Observed::Held(lease), Some(token)) => lease.token == token && lease.is_expired(),
        (Observed::Unreadable, None) => true,
        _ => false,
    };
    let taken = if still_broken {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::WriteError(path.display().to_string(), e)),
        }
        claim(path, config)?
    } else {
        debug!(lock = %path.display(), "lock changed hands, leaving it");
        None
    };
    breaker.release()?;

    if taken.is_some() {
        debug!(lock = %path.display(), "took over broken lock");
    }
    Ok(taken)
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: u64,
    lease: Duration,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn owned(&self) -> Result<bool> {
        Ok(matches!(observe(&self.path)?, Observed::Held(l) if l.token == self.token))
    }

    /// Push the expiry out by another lease period. Fails with
    /// [`Error::LockBroken`] when the lock was taken over.
    pub fn renew(&self) -> Result<()> {
        if !self.owned()? {
            return Err(Error::LockBroken {
                name: self.path.display().to_string(),
                stale: None,
            });
        }
        let lease = Lease::new(self.token, self.lease);
        file::write_bytes(&self.path, lease.encode().as_bytes())
    }

    /// Delete the lock file if it still carries our token. Returns whether
    /// anything was removed.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> Result<bool> {
        if !self.owned()? {
            warn!(lock = %self.path.display(), "lock no longer ours, leaving it");
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .map_err(|e| Error::WriteError(self.path.display().to_string(), e))?;
        Ok(true)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove() {
            warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
