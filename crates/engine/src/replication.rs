//! Replication bridge.
//!
//! The capture side is a [`Listener`] that serializes every record it sees
//! into a byte sink. The apply side reads those records back and re-applies
//! them to another (usually slave) [`EventLog`] under its writer lock.
//!
//! ## Wire record
//!
//! ```text
//! [timestamp_delta: u32 LE][record_type: u16 LE][length: u16 LE][cell_id: u32 LE]
//! [body: length granules]
//! ```
//!
//! `timestamp_delta` is the wrapping difference from the previous record's
//! timestamp (the first record is relative to the bind time base).
//! `cell_id == 0` marks a log event, anything else a cell update. The body
//! uses the same granule encoding as log records, re-padded by the capture.
use byteorder::{ByteOrder, LittleEndian};
use codec::{decode_body, encode_body, validate_record, ScanState};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::{EventDbError, EventLog, Listener, ListenerId, Result, BLOCK};

/// Encoded size of the fixed part of a wire record.
pub const WIRE_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRecord {
    pub timestamp_delta: u32,
    pub record_type: u16,
    /// `0` for a log event.
    pub cell_id: u32,
    pub payload: Vec<u8>,
}

impl ReplicationRecord {
    /// Appends the wire form of this record to `out`.
    pub fn encode<R: RngCore + ?Sized>(&self, rng: &mut R, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.extend_from_slice(&[0u8; WIRE_HEADER_SIZE]);
        let length = match encode_body(&self.payload, rng, out) {
            Ok(length) => length,
            Err(e) => {
                out.truncate(start);
                return Err(e.into());
            }
        };
        let header = &mut out[start..start + WIRE_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], self.timestamp_delta);
        LittleEndian::write_u16(&mut header[4..6], self.record_type);
        LittleEndian::write_u16(&mut header[6..8], length);
        LittleEndian::write_u32(&mut header[8..12], self.cell_id);
        Ok(())
    }

    /// Reads one record. Returns `None` on a clean end of stream; a stream
    /// ending inside a record is an error.
    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Option<Self>> {
        let mut header = [0u8; WIRE_HEADER_SIZE];
        match fill(r, &mut header)? {
            0 => return Ok(None),
            WIRE_HEADER_SIZE => {}
            n => return Err(truncated(n)),
        }
        let length = LittleEndian::read_u16(&header[6..8]);
        let mut body = vec![0u8; length as usize * BLOCK as usize];
        let n = fill(r, &mut body)?;
        if n != body.len() {
            return Err(truncated(WIRE_HEADER_SIZE + n));
        }
        Ok(Some(Self {
            timestamp_delta: LittleEndian::read_u32(&header[0..4]),
            record_type: LittleEndian::read_u16(&header[4..6]),
            cell_id: LittleEndian::read_u32(&header[8..12]),
            payload: decode_body(&body).to_vec(),
        }))
    }
}

/// Reads until `buf` is full or the stream ends; returns bytes read.
fn fill<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn truncated(got: usize) -> EventDbError {
    EventDbError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("replication stream ended inside a record after {} bytes", got),
    ))
}

struct Capture<W> {
    sink: W,
    last_time: u32,
    rng: SmallRng,
    records: u64,
}

/// Capture side: a listener writing every update to `sink` in wire form.
///
/// Create with [`new`](Self::new), then [`bind`](Self::bind) to a database
/// to receive its history from a chosen offset followed by live updates.
pub struct ReplicationListener<W> {
    capture: Mutex<Capture<W>>,
    id: Mutex<Option<ListenerId>>,
}

impl<W: Write + Send + 'static> ReplicationListener<W> {
    pub fn new(sink: W) -> Arc<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0xC0DE);
        Self::with_seed(sink, seed)
    }

    /// Like [`new`](Self::new) with a fixed padding seed.
    pub fn with_seed(sink: W, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            capture: Mutex::new(Capture {
                sink,
                last_time: 0,
                rng: SmallRng::seed_from_u64(seed),
                records: 0,
            }),
            id: Mutex::new(None),
        })
    }

    /// Replays `db` from block `start_offset` into the sink, then registers
    /// for live updates. `time_base` is the timestamp in effect just before
    /// `start_offset` (`0` when starting at the beginning of the log).
    ///
    /// Starting mid-log adopts the checksum found at `start_offset`.
    pub fn bind(self: &Arc<Self>, db: &EventLog, start_offset: u64, time_base: u32) -> Result<ListenerId> {
        if self.id.lock().is_some() {
            return Err(EventDbError::InvalidArgument(
                "replication listener is already bound".to_string(),
            ));
        }
        self.capture.lock().last_time = time_base;

        let listener: Arc<dyn Listener> = Arc::clone(self) as Arc<dyn Listener>;
        let state = ScanState {
            checksum: 0,
            cur_time: time_base,
        };
        let id = db.catch_up(listener, start_offset * BLOCK, state, start_offset != 0)?;
        *self.id.lock() = Some(id);
        Ok(id)
    }

    /// Stops live capture. Returns `false` if the listener was not bound.
    pub fn unbind(&self, db: &EventLog) -> bool {
        let id = self.id.lock().take();
        id.is_some_and(|id| db.remove_listener(id))
    }

    pub fn records_sent(&self) -> u64 {
        self.capture.lock().records
    }

    /// Runs `f` with exclusive access to the sink.
    pub fn with_sink<T>(&self, f: impl FnOnce(&mut W) -> T) -> T {
        f(&mut self.capture.lock().sink)
    }

    fn emit(&self, cell_id: u32, timestamp: u32, record_type: u16, payload: &[u8]) -> anyhow::Result<()> {
        let mut capture = self.capture.lock();
        let capture = &mut *capture;
        let record = ReplicationRecord {
            timestamp_delta: timestamp.wrapping_sub(capture.last_time),
            record_type,
            cell_id,
            payload: payload.to_vec(),
        };
        let mut buf = Vec::with_capacity(WIRE_HEADER_SIZE + payload.len() + BLOCK as usize);
        record.encode(&mut capture.rng, &mut buf)?;
        capture.sink.write_all(&buf)?;
        capture.sink.flush()?;
        capture.last_time = timestamp;
        capture.records += 1;
        Ok(())
    }
}

impl<W: Write + Send + 'static> Listener for ReplicationListener<W> {
    fn on_update(&self, _offset: u64, timestamp: u32, record_type: u16, payload: &[u8]) -> anyhow::Result<()> {
        self.emit(0, timestamp, record_type, payload)
    }

    fn on_update_cell(
        &self,
        cell_id: u32,
        _offset: u64,
        timestamp: u32,
        record_type: u16,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.emit(cell_id, timestamp, record_type, payload)
    }
}

/// Apply side: decodes wire records and rebases their timestamps.
#[derive(Debug)]
pub struct ReplicationReader<R> {
    rdr: R,
    master_time: u32,
    time_offset: i64,
    records: u64,
}

impl<R: Read> ReplicationReader<R> {
    /// `time_base` must match the capture's bind time base; `time_offset` is
    /// added to every reconstructed timestamp (saturating into `u32`).
    pub fn new(rdr: R, time_base: u32, time_offset: i64) -> Self {
        Self {
            rdr,
            master_time: time_base,
            time_offset,
            records: 0,
        }
    }

    /// Next record with its local timestamp, or `None` at end of stream.
    pub fn read_record(&mut self) -> Result<Option<(ReplicationRecord, u32)>> {
        let Some(record) = ReplicationRecord::read_from(&mut self.rdr)? else {
            return Ok(None);
        };
        self.master_time = self.master_time.wrapping_add(record.timestamp_delta);
        let local = (i64::from(self.master_time) + self.time_offset).clamp(0, i64::from(u32::MAX));
        self.records += 1;
        Ok(Some((record, local as u32)))
    }

    pub fn records_read(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> R {
        self.rdr
    }
}

impl EventLog {
    /// Reads one wire record from `reader` and applies it under the writer
    /// lock. Returns `false` at end of stream.
    ///
    /// This is the only way to write to a slave. A failure while applying
    /// closes the database, like a failed [`Transaction`](crate::Transaction).
    pub fn read_replication_data<R: Read>(&self, reader: &mut ReplicationReader<R>) -> Result<bool> {
        self.ensure_open()?;
        if self.config.flags.read_only {
            return Err(EventDbError::ReadOnly);
        }
        let Some((record, time)) = reader.read_record()? else {
            return Ok(false);
        };
        validate_record(record.record_type, record.payload.len())?;

        let mut guard = self.lock_open()?;
        let inner = &mut *guard;
        if record.cell_id != 0 {
            inner.cells.map().check_gap(record.cell_id, self.config.max_cell_gap)?;
        }
        let applied = if record.cell_id == 0 {
            self.send_update_trn(inner, record.record_type, &record.payload, time)
                .map(|a| a.block_offset)
        } else {
            self.update_st_event_trn(inner, record.cell_id, record.record_type, &record.payload, time)
        };
        match applied {
            Ok(offset) => {
                debug!(
                    cell_id = record.cell_id,
                    record_type = record.record_type,
                    offset,
                    time,
                    "applied replication record"
                );
                let wait = inner.throttle(time);
                drop(guard);
                if !wait.is_zero() {
                    debug!(wait_secs = wait.as_secs(), "replication apply above rate limit; backing off");
                    thread::sleep(wait);
                }
                Ok(true)
            }
            Err(e) => {
                self.poison(inner, &e);
                Err(e)
            }
        }
    }

    /// Applies records until the stream ends. Returns how many were applied.
    pub fn apply_replication_stream<R: Read>(&self, reader: &mut ReplicationReader<R>) -> Result<u64> {
        let mut applied = 0;
        while self.read_replication_data(reader)? {
            applied += 1;
        }
        Ok(applied)
    }
}
