//! # Advisory Locks
//!
//! A writer holds an advisory lock, keyed by the first global sequence number
//! it reserved, for as long as its event transaction is open. The global
//! cursor asks [`AdvisoryLocks::is_held`] about a missing number to tell
//! "still being written" apart from "abandoned".
//!
//! SQLite has no advisory locks, so the primitive is supplied separately:
//!
//! - [`LockFileLocks`]: one OS file lock per key in a lock directory. Works
//!   across processes sharing the database file. The OS drops the lock if the
//!   writer dies, which is exactly "transaction ended".
//! - [`InProcessLocks`]: a shared set of held keys. Enough when every writer
//!   and reader lives in one process, and the only option for in-memory
//!   databases.
//!
//! ## Lifecycle
//!
//! ```text
//! writer:  acquire(g) ─► commit reservation ─► insert events ─► commit/rollback ─► drop guard
//! reader:                                       is_held(g) = true ───────────────► is_held(g) = false
//! ```
//!
//! The lock is taken *before* the reservation commits, so no reader can ever
//! see `g` as reserved while its lock is still missing.

use std::collections::HashSet;
use std::fmt::Debug;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::warn;

use crate::{Error, Result};

// =============================================================================
// Trait
// =============================================================================

/// A registry of transaction-scoped advisory locks keyed by integers.
pub trait AdvisoryLocks: Send + Sync + Debug {
    /// Acquires the lock for `key`, waiting if another holder has it.
    ///
    /// The lock is released when the returned guard is dropped.
    fn acquire(&self, key: i64) -> Result<AdvisoryLock>;

    /// Non-blocking probe: is some live holder keeping `key` locked?
    ///
    /// Never takes the lock in a way that outlives the call.
    fn is_held(&self, key: i64) -> Result<bool>;
}

/// A held advisory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct AdvisoryLock {
    key: i64,
    inner: Held,
}

#[derive(Debug)]
enum Held {
    File { file: Option<File>, path: PathBuf },
    InProcess(Arc<Registry>),
}

impl AdvisoryLock {
    /// The locked key.
    pub fn key(&self) -> i64 {
        self.key
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        match &mut self.inner {
            Held::File { file, path } => {
                // Unlink first so that a file found later is never a live lock
                // being torn down; closing the handle releases the lock.
                match std::fs::remove_file(path.as_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(key = self.key, path = %path.display(), error = %e, "failed to remove lock file");
                    }
                }
                drop(file.take());
            }
            Held::InProcess(registry) => registry.release(self.key),
        }
    }
}

// =============================================================================
// Lock Files
// =============================================================================

/// Advisory locks backed by OS file locks, one file per key.
///
/// # Example
///
/// ```rust,no_run
/// use ledgerdb::advisory::{AdvisoryLocks, LockFileLocks};
///
/// let locks = LockFileLocks::new("events.db.locks")?;
/// let guard = locks.acquire(42)?;
/// assert!(locks.is_held(42)?);
/// drop(guard);
/// assert!(!locks.is_held(42)?);
/// # Ok::<(), ledgerdb::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct LockFileLocks {
    dir: PathBuf,
}

impl LockFileLocks {
    /// Uses `dir` for lock files, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| Error::AdvisoryLock { key: 0, source })?;
        Ok(Self { dir })
    }

    /// The lock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: i64) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }
}

impl AdvisoryLocks for LockFileLocks {
    fn acquire(&self, key: i64) -> Result<AdvisoryLock> {
        let path = self.path_for(key);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| Error::AdvisoryLock { key, source })?;
        file.lock().map_err(|source| Error::AdvisoryLock { key, source })?;

        Ok(AdvisoryLock {
            key,
            inner: Held::File {
                file: Some(file),
                path,
            },
        })
    }

    fn is_held(&self, key: i64) -> Result<bool> {
        // Never create the file here: a missing file means nobody holds the key.
        let file = match File::open(self.path_for(key)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(Error::AdvisoryLock { key, source }),
        };

        // A shared lock conflicts with the holder's exclusive lock but not with
        // other probes. It is released when `file` closes at the end of scope.
        match file.try_lock_shared() {
            Ok(()) => Ok(false),
            Err(TryLockError::WouldBlock) => Ok(true),
            Err(TryLockError::Error(source)) => Err(Error::AdvisoryLock { key, source }),
        }
    }
}

// =============================================================================
// In-Process Registry
// =============================================================================

/// Advisory locks visible only inside the current process.
///
/// Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct InProcessLocks {
    registry: Arc<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl Registry {
    fn release(&self, key: i64) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&key);
        self.released.notify_all();
    }
}

impl InProcessLocks {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdvisoryLocks for InProcessLocks {
    fn acquire(&self, key: i64) -> Result<AdvisoryLock> {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while held.contains(&key) {
            held = self
                .registry
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key);

        Ok(AdvisoryLock {
            key,
            inner: Held::InProcess(Arc::clone(&self.registry)),
        })
    }

    fn is_held(&self, key: i64) -> Result<bool> {
        let held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(held.contains(&key))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_process_acquire_and_release() {
        let locks = InProcessLocks::new();
        assert!(!locks.is_held(7).unwrap());

        let guard = locks.acquire(7).unwrap();
        assert_eq!(guard.key(), 7);
        assert!(locks.is_held(7).unwrap());
        assert!(!locks.is_held(8).unwrap());

        drop(guard);
        assert!(!locks.is_held(7).unwrap());
    }

    #[test]
    fn test_in_process_clones_share_state() {
        let writer = InProcessLocks::new();
        let reader = writer.clone();

        let _guard = writer.acquire(1).unwrap();
        assert!(reader.is_held(1).unwrap());
    }

    #[test]
    fn test_in_process_second_acquire_waits() {
        let locks = InProcessLocks::new();
        let guard = locks.acquire(3).unwrap();

        let other = locks.clone();
        let waiter = std::thread::spawn(move || {
            let _second = other.acquire(3).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!locks.is_held(3).unwrap());
    }

    #[test]
    fn test_lock_file_probe_sees_holder() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockFileLocks::new(dir.path().join("locks")).unwrap();

        assert!(!locks.is_held(10).unwrap());
        let guard = locks.acquire(10).unwrap();

        // A second registry on the same directory stands in for another process.
        let other = LockFileLocks::new(locks.dir()).unwrap();
        assert!(other.is_held(10).unwrap());
        assert!(other.is_held(10).unwrap(), "probing must not disturb the holder");

        drop(guard);
        assert!(!other.is_held(10).unwrap());
        assert!(!dir.path().join("locks").join("10.lock").exists());
    }

    #[test]
    fn test_lock_file_left_behind_is_not_held() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockFileLocks::new(dir.path()).unwrap();

        // A crashed writer leaves its file without a lock on it.
        std::fs::write(dir.path().join("99.lock"), b"").unwrap();
        assert!(!locks.is_held(99).unwrap());
    }
}
