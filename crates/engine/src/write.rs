//! Write path: `Transaction`, the guarded `*_trn` operations and poisoning.
//!
//! Every mutation runs while holding the writer lock. Arguments are checked
//! before anything touches disk; a failure after that point (I/O error or a
//! listener refusing the record) is unrecoverable and closes the instance.
use codec::{validate_record, write_block, Appended};
use parking_lot::MutexGuard;
use std::io::{Seek, SeekFrom};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::{EventDbError, EventLog, Result, WriterState};

/// Exclusive write access to an [`EventLog`].
///
/// Holds the writer lock until committed or dropped. If the rate limiter
/// asked for a back-off, the sleep happens after the lock is released.
pub struct Transaction<'a> {
    db: &'a EventLog,
    inner: Option<MutexGuard<'a, WriterState>>,
    backoff: Duration,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("path", &self.db.log_path)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<'a> Transaction<'a> {
    /// Appends one record to the log and notifies every listener.
    ///
    /// Returns the block offset of the record. A `time` earlier than the
    /// previous record's is recorded as the previous timestamp.
    pub fn send_update(&mut self, record_type: u16, payload: &[u8], time: u32) -> Result<u64> {
        self.db.ensure_open()?;
        self.db.check_direct_write()?;
        validate_record(record_type, payload.len())?;

        let db = self.db;
        let inner = self
            .inner
            .as_deref_mut()
            .ok_or(EventDbError::EngineClosed)?;
        match db.send_update_trn(inner, record_type, payload, time) {
            Ok(appended) => {
                self.backoff = self.backoff.max(inner.throttle(appended.timestamp));
                Ok(appended.block_offset)
            }
            Err(e) => {
                db.poison(inner, &e);
                Err(e)
            }
        }
    }

    /// Stores a new value for `cell_id` and notifies every listener.
    ///
    /// Returns the block offset of the cell's frame in the cell store.
    pub fn update_cell(
        &mut self,
        cell_id: u32,
        record_type: u16,
        payload: &[u8],
        time: u32,
    ) -> Result<u64> {
        self.db.ensure_open()?;
        self.db.check_direct_write()?;
        validate_record(record_type, payload.len())?;
        if cell_id == 0 {
            return Err(EventDbError::InvalidArgument(
                "cell id 0 is reserved".to_string(),
            ));
        }

        let db = self.db;
        let inner = self
            .inner
            .as_deref_mut()
            .ok_or(EventDbError::EngineClosed)?;
        inner.cells.map().check_gap(cell_id, db.config.max_cell_gap)?;
        match db.update_st_event_trn(inner, cell_id, record_type, payload, time) {
            Ok(offset) => {
                self.backoff = self.backoff.max(inner.throttle(time));
                Ok(offset)
            }
            Err(e) => {
                db.poison(inner, &e);
                Err(e)
            }
        }
    }

    /// Hands out a fresh cell id (does not need the lock).
    pub fn alloc_cell(&self) -> u32 {
        self.db.alloc_cell()
    }

    /// Committed log size in bytes, as seen inside this transaction.
    pub fn file_size(&self) -> u64 {
        self.inner.as_deref().map_or(0, |inner| inner.write_pos)
    }

    /// Ends the transaction. Every update is already durable when its call
    /// returned; this only releases the lock (and applies any back-off).
    pub fn commit(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        drop(self.inner.take());
        if !self.backoff.is_zero() {
            debug!(wait_secs = self.backoff.as_secs(), "write rate above limit; backing off");
            thread::sleep(self.backoff);
        }
    }
}

impl EventLog {
    /// Starts a write transaction, blocking until the writer lock is free.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        if self.config.flags.read_only {
            return Err(EventDbError::ReadOnly);
        }
        let inner = self.lock_open()?;
        Ok(Transaction {
            db: self,
            inner: Some(inner),
            backoff: Duration::ZERO,
        })
    }

    /// Single-record convenience wrapper around [`transaction`](Self::transaction).
    pub fn send_update(&self, record_type: u16, payload: &[u8], time: u32) -> Result<u64> {
        let mut trn = self.transaction()?;
        let offset = trn.send_update(record_type, payload, time)?;
        trn.commit();
        Ok(offset)
    }

    /// Single-cell convenience wrapper around [`transaction`](Self::transaction).
    pub fn update_cell(
        &self,
        cell_id: u32,
        record_type: u16,
        payload: &[u8],
        time: u32,
    ) -> Result<u64> {
        let mut trn = self.transaction()?;
        let offset = trn.update_cell(cell_id, record_type, payload, time)?;
        trn.commit();
        Ok(offset)
    }

    pub(crate) fn check_direct_write(&self) -> Result<()> {
        if self.config.slave {
            return Err(EventDbError::SlaveModeViolation);
        }
        Ok(())
    }

    /// Appends one record at `write_pos` and fans it out.
    ///
    /// If a listener fails, the file is truncated back to its previous size
    /// and the chain state restored before the error is returned.
    pub(crate) fn send_update_trn(
        &self,
        inner: &mut WriterState,
        record_type: u16,
        payload: &[u8],
        time: u32,
    ) -> Result<Appended> {
        let log = inner.log.as_mut().ok_or(EventDbError::ReadOnly)?;
        if time < inner.state.last_timestamp {
            warn!(
                time,
                last_timestamp = inner.state.last_timestamp,
                "timestamp went backwards; clamping"
            );
        }

        let start = inner.write_pos;
        let prev_state = inner.state;
        log.seek(SeekFrom::Start(start))?;
        let appended = match write_block(
            log,
            start,
            record_type,
            payload,
            time,
            &mut inner.state,
            &mut inner.rng,
        ) {
            Ok(appended) => appended,
            Err(e) => {
                // A short write may have left partial bytes behind.
                let _ = log.set_len(start);
                return Err(e.into());
            }
        };

        let failed = inner.listeners.iter().find_map(|(id, l)| {
            l.on_update(appended.block_offset, appended.timestamp, record_type, payload)
                .err()
                .map(|e| (*id, e))
        });
        if let Some((id, e)) = failed {
            error!(
                listener = %id,
                offset = appended.block_offset,
                rollback_to = start,
                error = %e,
                "listener rejected record; rolling back log"
            );
            if let Err(te) = log.set_len(start) {
                error!(error = %te, "rollback truncate failed");
            }
            inner.state = prev_state;
            return Err(EventDbError::Listener(e));
        }

        inner.write_pos = start + appended.bytes_written;
        inner.bytes_written += appended.bytes_written;
        if self.config.sync {
            log.sync_data()?;
        }
        Ok(appended)
    }

    /// Writes a cell value and fans it out, undoing the cell store change if
    /// a listener fails.
    pub(crate) fn update_st_event_trn(
        &self,
        inner: &mut WriterState,
        cell_id: u32,
        record_type: u16,
        payload: &[u8],
        time: u32,
    ) -> Result<u64> {
        if inner.log.is_none() {
            return Err(EventDbError::ReadOnly);
        }
        let write = inner.cells.write(
            cell_id,
            record_type,
            payload,
            time,
            self.config.max_cell_gap,
            &mut inner.rng,
        )?;
        self.next_cell_id
            .fetch_max(cell_id.saturating_add(1), Ordering::SeqCst);

        let failed = inner.listeners.iter().find_map(|(id, l)| {
            l.on_update_cell(cell_id, write.offset, time, record_type, payload)
                .err()
                .map(|e| (*id, e))
        });
        if let Some((id, e)) = failed {
            error!(
                listener = %id,
                cell_id,
                offset = write.offset,
                relocated = write.relocated,
                error = %e,
                "listener rejected cell update; rolling back cell store"
            );
            if let Err(re) = inner.cells.rollback(write.undo) {
                error!(error = %re, "cell rollback failed");
            }
            return Err(EventDbError::Listener(e));
        }

        inner.bytes_written += write.bytes_written;
        if self.config.sync {
            inner.cells.sync()?;
        }
        Ok(write.offset)
    }

    /// Marks the instance closed after an unrecoverable write failure and
    /// releases every listener.
    pub(crate) fn poison(&self, inner: &mut WriterState, cause: &EventDbError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(
            path = %self.log_path.display(),
            write_pos = inner.write_pos,
            error = %cause,
            "write failed; closing event log"
        );
        for (_, listener) in inner.listeners.drain(..) {
            listener.on_release();
        }
    }
}
