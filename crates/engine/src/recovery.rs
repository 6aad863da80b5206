//! Replay logic: open-time recovery, `rescan`, `rescan_all` and the
//! race-free listener attach protocol.
//!
//! All replays read the log through their own read-only handle, so the
//! unlocked catch-up passes never touch the writer's file position.
use cellstore::{CellStore, CellValue};
use codec::{BlockReader, CodecError, LogRecord, ScanState};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::{EventDbError, EventDbConfig, EventLog, Listener, ListenerId, Result, BLOCK};

/// Replays log bytes `[from, to)` of `path`, handing each record to
/// `on_record`. Returns the byte offset where replay stopped, which is past
/// `to` if the last record straddles it.
///
/// Every failure is wrapped in [`EventDbError::Rescan`] with the block
/// offset and (if known) record type of the record being read.
pub(crate) fn replay_range<F>(
    path: &Path,
    from: u64,
    to: u64,
    state: &mut ScanState,
    skip_first_check: bool,
    mut on_record: F,
) -> Result<u64>
where
    F: FnMut(&LogRecord) -> anyhow::Result<()>,
{
    if from >= to {
        return Ok(from);
    }
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut reader = BlockReader::new(file, from, to, *state, skip_first_check);

    loop {
        let record = match reader.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) => {
                return Err(EventDbError::rescan(
                    reader.offset() / BLOCK,
                    reader.last_header().map(|h| h.record_type),
                    e.into(),
                ))
            }
        };
        on_record(&record).map_err(|e| {
            EventDbError::rescan(record.offset, Some(record.record_type), EventDbError::Listener(e))
        })?;
    }

    *state = reader.state();
    Ok(reader.offset())
}

/// Reads every live cell in id order and hands it to `on_cell`.
pub(crate) fn replay_cells<F>(cells: &mut CellStore, mut on_cell: F) -> Result<usize>
where
    F: FnMut(&CellValue) -> anyhow::Result<()>,
{
    let slots: Vec<_> = cells.map().iter().collect();
    for &(cell_id, slot) in &slots {
        let value = cells
            .read_slot(cell_id, slot)
            .map_err(|e| EventDbError::rescan(slot.offset / BLOCK, None, e.into()))?;
        on_cell(&value).map_err(|e| {
            EventDbError::rescan(value.offset, Some(value.record_type), EventDbError::Listener(e))
        })?;
    }
    Ok(slots.len())
}

/// Full replay: prior segments, then the log up to `log_size`, then every
/// cell, framed by `on_start_rescan` / `on_end_rescan`.
///
/// The log is always parsed and verified, even with no listeners, because
/// the returned chain state seeds the writer.
pub(crate) fn replay_history(
    config: &EventDbConfig,
    log_size: u64,
    cells: &mut CellStore,
    listeners: &[Arc<dyn Listener>],
) -> Result<ScanState> {
    for l in listeners {
        l.on_start_rescan().map_err(EventDbError::Listener)?;
    }

    for segment in &config.prior_segments {
        let size = fs::metadata(segment)?.len();
        let mut seg_state = ScanState::default();
        replay_whole(segment, size, &mut seg_state, listeners)?;
        debug!(segment = %segment.display(), bytes = size, "replayed prior segment");
    }

    let mut state = ScanState::default();
    replay_whole(&config.path, log_size, &mut state, listeners)?;

    let cell_count = replay_cells(cells, |v| {
        for l in listeners {
            l.on_update_cell(v.cell_id, v.offset, v.timestamp, v.record_type, &v.payload)?;
        }
        Ok(())
    })?;
    debug!(path = %config.path.display(), bytes = log_size, cells = cell_count, "history replayed");

    for l in listeners {
        l.on_end_rescan().map_err(EventDbError::Listener)?;
    }
    Ok(state)
}

/// Replays a complete file and insists that replay ends at `size`.
fn replay_whole(
    path: &Path,
    size: u64,
    state: &mut ScanState,
    listeners: &[Arc<dyn Listener>],
) -> Result<()> {
    let end = replay_range(path, 0, size, state, false, |r| {
        for l in listeners {
            l.on_update(r.offset, r.timestamp, r.record_type, &r.payload)?;
        }
        Ok(())
    })
    .map_err(|e| as_truncated(e, size))?;
    if end != size {
        return Err(EventDbError::TruncatedLog {
            replayed: end,
            file_size: size,
        });
    }
    Ok(())
}

/// A record cut off by end-of-file means the tail is truncated.
fn as_truncated(e: EventDbError, file_size: u64) -> EventDbError {
    if let EventDbError::Rescan { offset, source, .. } = &e {
        if matches!(**source, EventDbError::Codec(CodecError::UnexpectedEof { .. })) {
            return EventDbError::TruncatedLog {
                replayed: offset * BLOCK,
                file_size,
            };
        }
    }
    e
}

impl EventLog {
    /// Replays log blocks `[from, to)` (block indexes).
    ///
    /// With `listener` the records go to that listener only and no lock is
    /// held. Without one they go to every registered listener while holding
    /// the writer lock. `state` carries the chain across calls; with
    /// `skip_checksum_check` the first header's checksum is adopted instead
    /// of verified, which is how a replay starting mid-log begins.
    ///
    /// Returns the block index where replay stopped.
    pub fn rescan(
        &self,
        from: u64,
        to: u64,
        state: &mut ScanState,
        skip_checksum_check: bool,
        listener: Option<&dyn Listener>,
    ) -> Result<u64> {
        let (from, to) = (from * BLOCK, to * BLOCK);
        let end = match listener {
            Some(l) => {
                let to = to.min(self.file_size()?);
                replay_range(&self.log_path, from, to, state, skip_checksum_check, |r| {
                    l.on_update(r.offset, r.timestamp, r.record_type, &r.payload)
                })?
            }
            None => {
                let inner = self.lock_open()?;
                let to = to.min(inner.write_pos);
                replay_range(&self.log_path, from, to, state, skip_checksum_check, |r| {
                    for (_, l) in &inner.listeners {
                        l.on_update(r.offset, r.timestamp, r.record_type, &r.payload)?;
                    }
                    Ok(())
                })?
            }
        };
        Ok(end / BLOCK)
    }

    /// Replays the full history (prior segments, log, cells) to every
    /// registered listener under the writer lock.
    pub fn rescan_all(&self) -> Result<()> {
        let mut guard = self.lock_open()?;
        let inner = &mut *guard;
        let listeners: Vec<Arc<dyn Listener>> =
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
        replay_history(&self.config, inner.write_pos, &mut inner.cells, &listeners)?;
        Ok(())
    }

    /// Replays every live cell to every registered listener.
    pub fn rescan_st_events(&self) -> Result<usize> {
        let mut guard = self.lock_open()?;
        let inner = &mut *guard;
        let listeners = &inner.listeners;
        replay_cells(&mut inner.cells, |v| {
            for (_, l) in listeners {
                l.on_update_cell(v.cell_id, v.offset, v.timestamp, v.record_type, &v.payload)?;
            }
            Ok(())
        })
    }

    /// Registers `listener` after delivering the complete history to it.
    ///
    /// Two catch-up passes run without the lock so writers are not stalled;
    /// a third pass under the lock covers whatever was committed meanwhile,
    /// then replays every cell, and only then registers the listener. Each
    /// record therefore reaches the listener exactly once, in order.
    pub fn add_listener_and_sync(&self, listener: Arc<dyn Listener>) -> Result<ListenerId> {
        self.catch_up(listener, 0, ScanState::default(), false)
    }

    /// Attach protocol starting at byte `start` with chain state `state`.
    pub(crate) fn catch_up(
        &self,
        listener: Arc<dyn Listener>,
        start: u64,
        mut state: ScanState,
        mut skip_check: bool,
    ) -> Result<ListenerId> {
        self.ensure_open()?;
        listener.on_start_rescan().map_err(EventDbError::Listener)?;

        let mut deliver =
            |r: &LogRecord| listener.on_update(r.offset, r.timestamp, r.record_type, &r.payload);

        let mut pos = start;
        for pass in 1..=2 {
            let end = self.file_size()?;
            let next = replay_range(&self.log_path, pos, end, &mut state, skip_check, &mut deliver)?;
            if next > pos {
                skip_check = false;
            }
            debug!(pass, from = pos, to = next, "listener catch-up pass");
            pos = next;
        }

        let mut guard = self.lock_open()?;
        let inner = &mut *guard;
        let end = replay_range(
            &self.log_path,
            pos,
            inner.write_pos,
            &mut state,
            skip_check,
            &mut deliver,
        )?;
        let cells = replay_cells(&mut inner.cells, |v| {
            listener.on_update_cell(v.cell_id, v.offset, v.timestamp, v.record_type, &v.payload)
        })?;
        listener.on_end_rescan().map_err(EventDbError::Listener)?;

        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        debug!(listener = %id, from = pos, to = end, cells, "listener attached");
        inner.listeners.push((id, listener));
        Ok(id)
    }

    /// Unregisters a listener and calls its `on_release`. Returns `false`
    /// if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.listeners.iter().position(|(i, _)| *i == id) else {
            return false;
        };
        let (_, listener) = inner.listeners.remove(pos);
        drop(inner);
        listener.on_release();
        true
    }
}
