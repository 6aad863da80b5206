//! # Config - EventDB settings and on-disk format constants
//!
//! Every tunable of an [`EventDbConfig`] can be set in code through the
//! builder-style setters or loaded from the environment with
//! [`EventDbConfig::from_env`]:
//!
//! ```text
//! EVENTDB_PATH               append log path               (default: "events.log")
//! EVENTDB_SYNC               fsync after every commit      (default: "true")
//! EVENTDB_READ_ONLY          open without a writer handle  (default: "false")
//! EVENTDB_RESCAN             replay history to listeners   (default: "false")
//! EVENTDB_SLAVE              accept replicated writes only (default: "false")
//! EVENTDB_MAX_BYTES_PER_SEC  write-rate ceiling, 0 = off   (default: 0)
//! EVENTDB_RATE_WINDOW_SECS   rate limiter window           (default: 10)
//! EVENTDB_MAX_CELL_GAP       largest cell-id jump allowed  (default: 10000)
//! EVENTDB_PRIOR_SEGMENTS     ':'-separated older logs      (default: none)
//! ```
//!
//! Values that fail to parse fall back to their defaults.

use std::path::{Path, PathBuf};

/// Alignment unit of the append log and the cell store, in bytes.
///
/// Equal to the encoded block header size, so headers and body granules both
/// start on a block boundary and a block index is `byte_offset / BLOCK_SIZE`.
pub const BLOCK_SIZE: u64 = 8;

/// Default ceiling on how far past the end of the cell map a cell id may
/// land before the update is rejected as corrupt.
pub const DEFAULT_MAX_CELL_GAP: u32 = 10_000;

/// Default length of the rate limiter's measurement window, in time units.
pub const DEFAULT_RATE_WINDOW_SECS: u32 = 10;

/// Suffix appended to the log path to name the cell store file.
pub const CELLS_SUFFIX: &str = ".cells";

/// Flags controlling how [`EventDbConfig::path`] is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open without a writer handle; every transaction is refused.
    pub read_only: bool,
    /// Replay the full history to the listeners supplied at open.
    pub rescan: bool,
}

impl OpenFlags {
    /// Read-write, no open-time replay to listeners.
    pub const NONE: OpenFlags = OpenFlags {
        read_only: false,
        rescan: false,
    };

    /// Returns a copy with `read_only` set.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Returns a copy with `rescan` set.
    #[must_use]
    pub fn rescan(mut self) -> Self {
        self.rescan = true;
        self
    }
}

/// Full configuration of one EventDB instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDbConfig {
    /// Path of the append log. The cell store lives next to it.
    pub path: PathBuf,
    pub flags: OpenFlags,
    /// If `true`, both backing files are fsynced after every commit.
    pub sync: bool,
    /// Slave instances refuse application writes and only accept
    /// replicated ones.
    pub slave: bool,
    /// Write-rate ceiling in bytes per time unit. `0` disables throttling.
    pub max_bytes_per_sec: u64,
    pub rate_window_secs: u32,
    pub max_cell_gap: u32,
    /// Older, rotated log segments replayed (in order) before the primary
    /// log during a full rescan.
    pub prior_segments: Vec<PathBuf>,
    /// Seed of the per-instance padding filler generator. Derived from the
    /// clock when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for EventDbConfig {
    fn default() -> Self {
        Self::new("events.log")
    }
}

impl EventDbConfig {
    /// Creates a configuration with default settings for the log at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: OpenFlags::NONE,
            sync: true,
            slave: false,
            max_bytes_per_sec: 0,
            rate_window_secs: DEFAULT_RATE_WINDOW_SECS,
            max_cell_gap: DEFAULT_MAX_CELL_GAP,
            prior_segments: Vec::new(),
            rng_seed: None,
        }
    }

    /// Loads the configuration from `EVENTDB_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    ///
    /// Used by [`from_env`](Self::from_env); tests pass a map instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mut cfg = Self::new(get("EVENTDB_PATH", "events.log"));
        cfg.sync = get("EVENTDB_SYNC", "true").parse().unwrap_or(true);
        cfg.flags.read_only = get("EVENTDB_READ_ONLY", "false").parse().unwrap_or(false);
        cfg.flags.rescan = get("EVENTDB_RESCAN", "false").parse().unwrap_or(false);
        cfg.slave = get("EVENTDB_SLAVE", "false").parse().unwrap_or(false);
        cfg.max_bytes_per_sec = get("EVENTDB_MAX_BYTES_PER_SEC", "0").parse().unwrap_or(0);
        cfg.rate_window_secs = get("EVENTDB_RATE_WINDOW_SECS", "10")
            .parse()
            .unwrap_or(DEFAULT_RATE_WINDOW_SECS);
        cfg.max_cell_gap = get("EVENTDB_MAX_CELL_GAP", "10000")
            .parse()
            .unwrap_or(DEFAULT_MAX_CELL_GAP);
        cfg.prior_segments = get("EVENTDB_PRIOR_SEGMENTS", "")
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        cfg
    }

    /// Path of the cell store file: the log path with [`CELLS_SUFFIX`] appended.
    #[must_use]
    pub fn cells_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(CELLS_SUFFIX);
        PathBuf::from(name)
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_slave(mut self, slave: bool) -> Self {
        self.slave = slave;
        self
    }

    /// Sets the write-rate ceiling (bytes per time unit) and its window.
    pub fn with_rate_limit(mut self, max_bytes_per_sec: u64, window_secs: u32) -> Self {
        self.max_bytes_per_sec = max_bytes_per_sec;
        self.rate_window_secs = window_secs.max(1);
        self
    }

    pub fn with_max_cell_gap(mut self, gap: u32) -> Self {
        self.max_cell_gap = gap;
        self
    }

    pub fn with_prior_segments(mut self, segments: Vec<PathBuf>) -> Self {
        self.prior_segments = segments;
        self
    }

    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}
