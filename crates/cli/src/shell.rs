//! Command interpreter behind the interactive shell.
//!
//! Kept apart from `main` so the commands can be driven from unit tests
//! with an in-memory output buffer.

use anyhow::{Context, Result};
use engine::{EventLog, Listener, ReplicationListener, ReplicationReader, ScanState};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// What the read loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Collects log records for `DUMP`.
#[derive(Default)]
struct Collector {
    records: Mutex<Vec<(u64, u32, u16, Vec<u8>)>>,
}

impl Listener for Collector {
    fn on_update(&self, offset: u64, timestamp: u32, record_type: u16, payload: &[u8]) -> Result<()> {
        self.records
            .lock()
            .push((offset, timestamp, record_type, payload.to_vec()));
        Ok(())
    }
}

pub struct Shell {
    db: EventLog,
    clock: fn() -> u32,
}

impl Shell {
    pub fn new(db: EventLog) -> Self {
        Self::with_clock(db, unix_now)
    }

    /// Uses `clock` instead of the system time for new records.
    pub fn with_clock(db: EventLog, clock: fn() -> u32) -> Self {
        Self { db, clock }
    }

    pub fn db(&self) -> &EventLog {
        &self.db
    }

    /// Runs one command line, writing its response to `out`.
    ///
    /// Command failures are reported as `ERR ...` lines; only a failure to
    /// write to `out` is returned as an error.
    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(Flow::Continue);
        };
        let args: Vec<&str> = parts.collect();
        debug!(cmd, args = args.len(), "shell command");

        let result = match cmd.to_uppercase().as_str() {
            "APPEND" => self.append(&args, out),
            "CELL" => self.cell(&args, out),
            "ALLOC" => writeln!(out, "{}", self.db.alloc_cell()).map_err(Into::into),
            "GETCELL" => self.get_cell(&args, out),
            "DUMP" => self.dump(out),
            "EXPORT" => self.export(&args, out),
            "IMPORT" => self.import(&args, out),
            "STATS" => self.stats(out),
            "EXIT" | "QUIT" => {
                writeln!(out, "bye")?;
                return Ok(Flow::Exit);
            }
            other => writeln!(out, "unknown command: {}", other).map_err(Into::into),
        };
        if let Err(e) = result {
            writeln!(out, "ERR {:#}", e)?;
        }
        Ok(Flow::Continue)
    }

    /// `APPEND type payload...`
    fn append<W: Write>(&mut self, args: &[&str], out: &mut W) -> Result<()> {
        let Some((record_type, payload)) = args.split_first() else {
            anyhow::bail!("usage: APPEND type payload");
        };
        let record_type: u16 = record_type.parse().context("record type must be a u16")?;
        let payload = payload.join(" ");
        let offset = self
            .db
            .send_update(record_type, payload.as_bytes(), (self.clock)())?;
        writeln!(out, "OK offset={}", offset)?;
        Ok(())
    }

    /// `CELL id type payload...`
    fn cell<W: Write>(&mut self, args: &[&str], out: &mut W) -> Result<()> {
        if args.len() < 2 {
            anyhow::bail!("usage: CELL id type payload");
        }
        let cell_id: u32 = args[0].parse().context("cell id must be a u32")?;
        let record_type: u16 = args[1].parse().context("record type must be a u16")?;
        let payload = args[2..].join(" ");
        let offset = self
            .db
            .update_cell(cell_id, record_type, payload.as_bytes(), (self.clock)())?;
        writeln!(out, "OK offset={}", offset)?;
        Ok(())
    }

    /// `GETCELL id`
    fn get_cell<W: Write>(&mut self, args: &[&str], out: &mut W) -> Result<()> {
        let cell_id: u32 = args
            .first()
            .context("usage: GETCELL id")?
            .parse()
            .context("cell id must be a u32")?;
        match self.db.read_cell(cell_id)? {
            Some(v) => writeln!(
                out,
                "type={} t={} {}",
                v.record_type,
                v.timestamp,
                String::from_utf8_lossy(&v.payload)
            )?,
            None => writeln!(out, "(nil)")?,
        }
        Ok(())
    }

    /// `DUMP` - every record of the log, oldest first.
    fn dump<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let collector = Collector::default();
        let end = self.db.write_pos()?;
        self.db
            .rescan(0, end, &mut ScanState::default(), false, Some(&collector))?;

        let records = collector.records.into_inner();
        if records.is_empty() {
            writeln!(out, "(empty)")?;
            return Ok(());
        }
        for (offset, timestamp, record_type, payload) in &records {
            writeln!(
                out,
                "@{} t={} type={} {}",
                offset,
                timestamp,
                record_type,
                String::from_utf8_lossy(payload)
            )?;
        }
        writeln!(out, "({} records)", records.len())?;
        Ok(())
    }

    /// `EXPORT file [from_block time_base]` - writes a replication stream of
    /// the history (log, then cells) to `file`.
    fn export<W: Write>(&mut self, args: &[&str], out: &mut W) -> Result<()> {
        let path = args.first().context("usage: EXPORT file [from_block time_base]")?;
        let from: u64 = args.get(1).map_or(Ok(0), |s| s.parse()).context("bad from_block")?;
        let base: u32 = args.get(2).map_or(Ok(0), |s| s.parse()).context("bad time_base")?;

        let file = File::create(path).with_context(|| format!("cannot create {}", path))?;
        let capture = ReplicationListener::new(BufWriter::new(file));
        capture.bind(&self.db, from, base)?;
        capture.unbind(&self.db);
        capture.with_sink(|sink| sink.flush())?;
        writeln!(out, "OK exported {} records", capture.records_sent())?;
        Ok(())
    }

    /// `IMPORT file [time_offset time_base]` - applies a replication stream.
    fn import<W: Write>(&mut self, args: &[&str], out: &mut W) -> Result<()> {
        let path = args.first().context("usage: IMPORT file [time_offset time_base]")?;
        let offset: i64 = args.get(1).map_or(Ok(0), |s| s.parse()).context("bad time_offset")?;
        let base: u32 = args.get(2).map_or(Ok(0), |s| s.parse()).context("bad time_base")?;

        let file = File::open(path).with_context(|| format!("cannot open {}", path))?;
        let mut reader = ReplicationReader::new(BufReader::new(file), base, offset);
        let applied = self.db.apply_replication_stream(&mut reader)?;
        writeln!(out, "OK imported {} records", applied)?;
        Ok(())
    }

    fn stats<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let s = self.db.stats()?;
        writeln!(
            out,
            "write_pos={} file_size={} cells={} cell_file_size={} listeners={} last_timestamp={} checksum={:#06x}",
            s.write_pos,
            s.file_size,
            s.cell_count,
            s.cell_file_size,
            s.listeners,
            s.last_timestamp,
            s.checksum
        )?;
        Ok(())
    }

    /// Closes the database, flushing both files.
    pub fn close(self) -> Result<()> {
        self.db.close()?;
        Ok(())
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
