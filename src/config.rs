//! # Configuration
//!
//! Plain structs with `Default` impls and named constants. Environment
//! overrides are read by [`StoreConfig::from_env`] only; nothing else in the
//! crate looks at the environment.
//!
//! | Variable | Field | Unit |
//! |----------|-------|------|
//! | `LEDGERDB_LOCK_WAIT_MS` | [`StoreConfig::lock_wait`] | milliseconds |
//! | `LEDGERDB_LOCK_DIR` | [`StoreConfig::lock_dir`] | path |
//! | `LEDGERDB_LEASE_DURATION_MS` | [`StoreConfig::lease_duration`] | milliseconds |

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lease::DEFAULT_LEASE_DURATION;
use crate::schema::DEFAULT_LOCK_WAIT;
use crate::{Error, Result};

/// Default number of events a consumer fetches per tick.
pub const DEFAULT_CONSUMER_BATCH_SIZE: usize = 100;

/// Default number of events handed to a handler between lease refreshes.
pub const DEFAULT_HANDLER_CHUNK: usize = 10;

/// Default pause between consumer ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const ENV_LOCK_WAIT_MS: &str = "LEDGERDB_LOCK_WAIT_MS";
const ENV_LOCK_DIR: &str = "LEDGERDB_LOCK_DIR";
const ENV_LEASE_DURATION_MS: &str = "LEDGERDB_LEASE_DURATION_MS";

// =============================================================================
// Store Configuration
// =============================================================================

/// Configuration for an [`EventStore`](crate::EventStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a write waits for SQLite's write lock before `LockTimeout`.
    pub lock_wait: Duration,

    /// Directory for advisory lock files. `None` means `<database>.locks`.
    ///
    /// Every process writing to the same database must use the same
    /// directory, or the global cursor cannot see their in-flight appends.
    pub lock_dir: Option<PathBuf>,

    /// Reader threads. `None` picks one per CPU, clamped to a sane range.
    pub reader_threads: Option<usize>,

    /// How long a partition lease stays valid without a refresh.
    pub lease_duration: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_dir: None,
            reader_threads: None,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `LEDGERDB_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOperation`] if a duration variable is not a whole
    /// number of milliseconds.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_LOCK_WAIT_MS) {
            config.lock_wait = parse_millis(ENV_LOCK_WAIT_MS, &ms)?;
        }
        if let Some(dir) = lookup(ENV_LOCK_DIR) {
            config.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = lookup(ENV_LEASE_DURATION_MS) {
            config.lease_duration = parse_millis(ENV_LEASE_DURATION_MS, &ms)?;
        }
        Ok(config)
    }

    /// The lock directory to use for a database at `db_path`.
    pub fn lock_dir_for(&self, db_path: &Path) -> PathBuf {
        match &self.lock_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut dir = db_path.as_os_str().to_owned();
                dir.push(".locks");
                PathBuf::from(dir)
            }
        }
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| Error::InvalidOperation(format!("{key} must be milliseconds, got '{value}'")))
}

// =============================================================================
// Consumer Configuration
// =============================================================================

/// Configuration for a [`Consumer`](crate::consumer::Consumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Lease format; partitions are `(format, split_key)`.
    pub format: String,

    /// Events fetched from the global cursor per tick.
    pub batch_size: usize,

    /// Events passed to the handler between lease refreshes.
    pub handler_chunk: usize,

    /// Pause between ticks when running in the background.
    pub poll_interval: Duration,
}

impl ConsumerConfig {
    /// Defaults for the given lease format.
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            batch_size: DEFAULT_CONSUMER_BATCH_SIZE,
            handler_chunk: DEFAULT_HANDLER_CHUNK,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}
