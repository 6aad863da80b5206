//! # Engine - EventDB event log
//!
//! Ties the [`codec`] block format and the [`cellstore`] into an append-only
//! event log with live listeners, crash recovery and replication.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌────────────────────────────────────────────────────┐
//! │                     EVENTLOG                       │
//! │                                                    │
//! │ transaction() ── writer lock ──┐                   │
//! │                                v                   │
//! │ write.rs  → write_block → log file                 │
//! │           → CellStore::write → <log>.cells         │
//! │                 |                                  │
//! │                 v                                  │
//! │           listeners (on_update / on_update_cell)   │
//! │                 |   failure: roll back + poison    │
//! │                 v                                  │
//! │           SpeedWatcher (sleep after unlock)        │
//! │                                                    │
//! │ recovery.rs → open-time replay, rescan, attach     │
//! │ replication.rs → capture listener / apply side     │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                |
//! |-----------------|--------------------------------------------------------|
//! | `lib.rs`        | `EventLog` struct, `open`, accessors, `close`, `Drop`  |
//! | [`write`]       | `Transaction`, guarded write path, poisoning           |
//! | [`recovery`]    | Replay at open, `rescan`, `rescan_all`, listener attach |
//! | [`replication`] | Wire records, `ReplicationListener`, apply side        |
//! | [`limiter`]     | `SpeedWatcher` throughput limiter                      |
//!
//! ## Crash Safety
//!
//! Records are written with a single `write_all` at `write_pos`, and
//! `write_pos` only advances once every listener accepted the record. A
//! failed commit truncates the file back, so the log on disk is always the
//! exact concatenation of committed records. Open verifies this by replaying
//! the whole file and refusing to start if the replay stops short of the end.
mod error;
mod limiter;
mod listener;
mod recovery;
mod replication;
mod write;

pub use codec::{ScanState, MAX_PAYLOAD};
pub use config::{EventDbConfig, OpenFlags};
pub use cellstore::CellValue;
pub use error::{EventDbError, Result};
pub use limiter::SpeedWatcher;
pub use listener::{Listener, ListenerId};
pub use replication::{ReplicationListener, ReplicationReader, ReplicationRecord, WIRE_HEADER_SIZE};
pub use write::Transaction;

use cellstore::CellStore;
use codec::WriteState;
use listener::Registered;
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub(crate) const BLOCK: u64 = config::BLOCK_SIZE;

/// Everything guarded by the writer lock.
pub(crate) struct WriterState {
    /// Write handle; `None` for read-only instances.
    pub(crate) log: Option<File>,
    pub(crate) cells: CellStore,
    /// Byte length of the committed log.
    pub(crate) write_pos: u64,
    /// Bytes written to the log and the cell store, counted from their
    /// combined size at open. Drives the rate limiter.
    pub(crate) bytes_written: u64,
    pub(crate) state: WriteState,
    pub(crate) listeners: Registered,
    pub(crate) limiter: SpeedWatcher,
    pub(crate) rng: SmallRng,
}

impl WriterState {
    /// Feeds the byte counter to the rate limiter after a committed write.
    pub(crate) fn throttle(&mut self, time: u32) -> Duration {
        self.limiter.check_limit(self.bytes_written, time)
    }

    fn sync_files(&self) -> Result<()> {
        if let Some(log) = &self.log {
            log.sync_data()?;
            self.cells.sync()?;
        }
        Ok(())
    }
}

/// Snapshot returned by [`EventLog::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDbStats {
    /// End of the committed log, as a block index.
    pub write_pos: u64,
    /// Log file size in bytes.
    pub file_size: u64,
    /// Cells holding a value.
    pub cell_count: usize,
    pub cell_file_size: u64,
    pub listeners: usize,
    pub last_timestamp: u32,
    pub checksum: u16,
}

/// An open EventDB instance: the append log, its cell store, and the
/// registered listeners.
///
/// # Write Path
///
/// 1. [`transaction`](Self::transaction) takes the writer lock.
/// 2. [`Transaction::send_update`] appends one record and notifies every
///    listener; [`Transaction::update_cell`] does the same for a cell.
/// 3. Dropping or committing the transaction releases the lock, then sleeps
///    if the rate limiter asked for it.
///
/// Any failure inside step 2 other than a rejected argument closes the
/// instance for good (see [`EventDbError::EngineClosed`]).
///
/// # Recovery
///
/// [`open`](Self::open) replays any prior segments, the whole log and every
/// cell before returning, verifying the checksum chain on the way.
pub struct EventLog {
    pub(crate) config: EventDbConfig,
    pub(crate) log_path: PathBuf,
    pub(crate) inner: Mutex<WriterState>,
    pub(crate) next_cell_id: AtomicU32,
    pub(crate) next_listener_id: AtomicU64,
    pub(crate) closed: AtomicBool,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("EventLog");
        d.field("path", &self.log_path)
            .field("read_only", &self.config.flags.read_only)
            .field("slave", &self.config.slave)
            .field("closed", &self.is_closed());
        // Never block: the caller may be holding a transaction.
        if let Some(inner) = self.inner.try_lock() {
            d.field("write_pos", &inner.write_pos)
                .field("checksum", &inner.state.checksum)
                .field("last_timestamp", &inner.state.last_timestamp)
                .field("cells", &inner.cells.map().live_count())
                .field("listeners", &inner.listeners.len());
        }
        d.finish()
    }
}

impl EventLog {
    /// Opens (creating unless read-only) the log at `config.path` and its
    /// cell store, with no listeners.
    pub fn open(config: EventDbConfig) -> Result<Self> {
        Self::open_with_listeners(config, Vec::new())
    }

    /// Opens the database and registers `listeners`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Open (or create) the log and `<log>.cells`.
    /// 2. Rebuild the cell map from frame headers.
    /// 3. Replay prior segments, the log and all cells, verifying every
    ///    checksum. With [`OpenFlags::rescan`] this history is also
    ///    delivered to `listeners`, framed by `on_start_rescan` and
    ///    `on_end_rescan`.
    /// 4. Fail with [`EventDbError::TruncatedLog`] if the replay does not end
    ///    exactly at the file size.
    pub fn open_with_listeners(
        config: EventDbConfig,
        listeners: Vec<Arc<dyn Listener>>,
    ) -> Result<Self> {
        let started = Instant::now();
        let read_only = config.flags.read_only;
        let log_path = config.path.clone();

        let log = if read_only {
            None
        } else {
            if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&log_path)?,
            )
        };
        let file_size = fs::metadata(&log_path)?.len();

        let mut cells = CellStore::open(config.cells_path(), read_only)?;
        cells.scan(config.max_cell_gap)?;

        let replay_to: &[Arc<dyn Listener>] = if config.flags.rescan {
            &listeners
        } else {
            &[]
        };
        let scan = recovery::replay_history(&config, file_size, &mut cells, replay_to)?;

        let next_cell_id = cells.map().max_id().map_or(1, |id| id.saturating_add(1));
        let seed = config.rng_seed.unwrap_or_else(clock_seed);
        let bytes_written = file_size + cells.size();
        let limiter =
            SpeedWatcher::new(config.max_bytes_per_sec, config.rate_window_secs, bytes_written);
        let registered: Registered = listeners
            .into_iter()
            .enumerate()
            .map(|(i, l)| (ListenerId(i as u64), l))
            .collect();
        let next_listener_id = registered.len() as u64;

        info!(
            path = %log_path.display(),
            bytes = file_size,
            cells = cells.map().live_count(),
            read_only,
            slave = config.slave,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "event log opened"
        );

        Ok(Self {
            log_path,
            inner: Mutex::new(WriterState {
                log,
                cells,
                write_pos: file_size,
                bytes_written,
                state: scan.into(),
                listeners: registered,
                limiter,
                rng: SmallRng::seed_from_u64(seed),
            }),
            next_cell_id: AtomicU32::new(next_cell_id),
            next_listener_id: AtomicU64::new(next_listener_id),
            closed: AtomicBool::new(false),
            config,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    #[must_use]
    pub fn config(&self) -> &EventDbConfig {
        &self.config
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Committed log size in bytes. Takes the writer lock briefly.
    pub fn file_size(&self) -> Result<u64> {
        Ok(self.lock_open()?.write_pos)
    }

    /// End of the committed log as a block index.
    pub fn write_pos(&self) -> Result<u64> {
        Ok(self.file_size()? / BLOCK)
    }

    pub fn stats(&self) -> Result<EventDbStats> {
        let inner = self.lock_open()?;
        Ok(EventDbStats {
            write_pos: inner.write_pos / BLOCK,
            file_size: inner.write_pos,
            cell_count: inner.cells.map().live_count(),
            cell_file_size: inner.cells.size(),
            listeners: inner.listeners.len(),
            last_timestamp: inner.state.last_timestamp,
            checksum: inner.state.checksum,
        })
    }

    /// Hands out a fresh cell id. Lock-free.
    pub fn alloc_cell(&self) -> u32 {
        self.next_cell_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Latest value of `cell_id`, or `None` if it was never written.
    pub fn read_cell(&self, cell_id: u32) -> Result<Option<CellValue>> {
        let mut inner = self.lock_open()?;
        Ok(inner.cells.read_cell(cell_id)?)
    }

    /// Flushes both files to disk.
    pub fn sync(&self) -> Result<()> {
        self.lock_open()?.sync_files()
    }

    /// Flushes the files and releases every listener. Later calls fail with
    /// [`EventDbError::EngineClosed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = inner.sync_files();
        if let Err(e) = &res {
            warn!(path = %self.log_path.display(), error = %e, "sync on close failed");
        }
        let released: Vec<_> = inner.listeners.drain(..).collect();
        drop(inner);
        for (_, listener) in released {
            listener.on_release();
        }
        info!(path = %self.log_path.display(), "event log closed");
        res
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(EventDbError::EngineClosed);
        }
        Ok(())
    }

    /// Takes the writer lock, failing if the instance is (or became, while
    /// waiting) closed.
    pub(crate) fn lock_open(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.ensure_open()?;
        let guard = self.inner.lock();
        self.ensure_open()?;
        Ok(guard)
    }
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5EED)
}

/// Best-effort close on drop. Errors are ignored because Drop cannot
/// propagate them; committed records are already on disk.
impl Drop for EventLog {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests;
