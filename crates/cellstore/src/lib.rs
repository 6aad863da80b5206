//! # CellStore - mutable "latest value per id" storage
//!
//! The secondary file of an EventDB instance (`<log>.cells`). Each cell owns
//! one frame holding its most recent value; updates overwrite the frame in
//! place when the new body fits and otherwise move the cell to a fresh frame
//! at end-of-file. Abandoned frames stay behind as dead space; the store is
//! never compacted, so frame offsets remain stable for the whole session.
//!
//! The [`CellMap`] from cell id to live frame is rebuilt by [`CellStore::scan`]
//! from frame headers alone. Because relocation only ever appends, a later
//! frame for the same id always supersedes an earlier one.
//!
//! Frame layout: see [`FrameHeader`]. Bodies use the same granule encoding
//! as log records ([`codec::encode_body`]).

mod frame;
mod map;

pub use frame::{FrameHeader, FRAME_HEADER_SIZE};
pub use map::{CellMap, CellSlot};

use codec::{decode_body, encode_body, CodecError};
use rand::RngCore;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const BLOCK: u64 = config::BLOCK_SIZE;

#[derive(Debug, Error)]
pub enum CellStoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt cell store at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// A cell id lies too far past the end of the cell map.
    #[error("cell id {cell_id} is too far beyond the cell map (len {map_len})")]
    CellMapOverflow { cell_id: u32, map_len: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<CodecError> for CellStoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => CellStoreError::Io(e),
            CodecError::InvalidArgument(msg) => CellStoreError::InvalidArgument(msg),
            other => CellStoreError::InvalidArgument(other.to_string()),
        }
    }
}

/// A cell value read back from its frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellValue {
    pub cell_id: u32,
    /// Block index of the frame.
    pub offset: u64,
    pub timestamp: u32,
    pub record_type: u16,
    pub payload: Vec<u8>,
}

/// What [`CellStore::write`] changed, enough to undo it.
#[derive(Debug)]
pub struct CellUndo {
    cell_id: u32,
    prev_slot: Option<CellSlot>,
    prev_size: u64,
    overwritten: Option<(u64, Vec<u8>)>,
}

/// Outcome of a successful [`CellStore::write`].
#[derive(Debug)]
pub struct CellWrite {
    /// Block index of the frame now holding the cell.
    pub offset: u64,
    /// `true` when the cell moved to a new frame at end-of-file.
    pub relocated: bool,
    /// Frame bytes written, header included.
    pub bytes_written: u64,
    pub undo: CellUndo,
}

/// Cell store file plus its in-memory [`CellMap`].
pub struct CellStore {
    path: PathBuf,
    file: File,
    size: u64,
    map: CellMap,
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStore")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("live_cells", &self.map.live_count())
            .finish()
    }
}

impl CellStore {
    /// Opens (or, unless `read_only`, creates) the cell store at `path`.
    ///
    /// The map starts empty; call [`scan`](Self::scan) to rebuild it.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, CellStoreError> {
        let path = path.as_ref().to_path_buf();
        let file = if read_only {
            File::open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        };
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            map: CellMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes (dead frames included).
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn map(&self) -> &CellMap {
        &self.map
    }

    /// Walks every frame from offset 0 and rebuilds the cell map.
    ///
    /// A frame running past end-of-file is reported as corruption rather
    /// than ignored.
    pub fn scan(&mut self, max_gap: u32) -> Result<(), CellStoreError> {
        let mut map = CellMap::new();
        let mut rdr = BufReader::new(self.file.try_clone()?);
        rdr.seek(SeekFrom::Start(0))?;

        let mut offset = 0u64;
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        while offset < self.size {
            if offset + FRAME_HEADER_SIZE as u64 > self.size {
                return Err(CellStoreError::Corrupt {
                    offset,
                    reason: "truncated frame header".to_string(),
                });
            }
            rdr.read_exact(&mut raw)?;
            let header = FrameHeader::decode(&raw);
            header
                .validate()
                .map_err(|reason| CellStoreError::Corrupt { offset, reason })?;
            if offset + u64::from(header.frame_len) > self.size {
                return Err(CellStoreError::Corrupt {
                    offset,
                    reason: format!("frame of {} bytes runs past end of file", header.frame_len),
                });
            }

            map.ensure(header.cell_id, max_gap)?;
            map.set(
                header.cell_id,
                Some(CellSlot {
                    offset,
                    frame_len: header.frame_len,
                    length: header.length,
                }),
            );

            rdr.seek_relative(i64::from(header.frame_len) - FRAME_HEADER_SIZE as i64)?;
            offset += u64::from(header.frame_len);
        }

        self.map = map;
        Ok(())
    }

    /// Reads the live value of `cell_id`, if the cell has ever been written.
    pub fn read_cell(&mut self, cell_id: u32) -> Result<Option<CellValue>, CellStoreError> {
        match self.map.get(cell_id) {
            Some(slot) => self.read_slot(cell_id, slot).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the frame at `slot` and checks that it belongs to `cell_id`.
    pub fn read_slot(&mut self, cell_id: u32, slot: CellSlot) -> Result<CellValue, CellStoreError> {
        let used = FRAME_HEADER_SIZE + slot.length as usize * BLOCK as usize;
        let mut buf = vec![0u8; used];
        self.file.seek(SeekFrom::Start(slot.offset))?;
        self.file.read_exact(&mut buf)?;

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&raw);
        if header.cell_id != cell_id {
            return Err(CellStoreError::Corrupt {
                offset: slot.offset,
                reason: format!("frame holds cell {} instead of {}", header.cell_id, cell_id),
            });
        }

        Ok(CellValue {
            cell_id,
            offset: slot.offset / BLOCK,
            timestamp: header.timestamp,
            record_type: header.record_type,
            payload: decode_body(&buf[FRAME_HEADER_SIZE..]).to_vec(),
        })
    }

    /// Stores a new value for `cell_id`.
    ///
    /// Overwrites the current frame when the encoded body fits its capacity;
    /// otherwise appends a new, exactly sized frame at end-of-file. The map
    /// reflects the new location when this returns.
    pub fn write<R: RngCore + ?Sized>(
        &mut self,
        cell_id: u32,
        record_type: u16,
        payload: &[u8],
        timestamp: u32,
        max_gap: u32,
        rng: &mut R,
    ) -> Result<CellWrite, CellStoreError> {
        if cell_id == 0 {
            return Err(CellStoreError::InvalidArgument(
                "cell id 0 is reserved".to_string(),
            ));
        }
        let mut buf = vec![0u8; FRAME_HEADER_SIZE];
        let length = encode_body(payload, rng, &mut buf)?;
        self.map.ensure(cell_id, max_gap)?;

        let prev_slot = self.map.get(cell_id);
        let prev_size = self.size;

        let (offset, frame_len, overwritten) = match prev_slot {
            Some(slot) if slot_capacity(&slot) >= length as usize => {
                let used = FRAME_HEADER_SIZE + slot.length as usize * BLOCK as usize;
                let mut old = vec![0u8; used];
                self.file.seek(SeekFrom::Start(slot.offset))?;
                self.file.read_exact(&mut old)?;
                (slot.offset, slot.frame_len, Some((slot.offset, old)))
            }
            _ => (self.size, buf.len() as u32, None),
        };
        let relocated = overwritten.is_none();

        let header = FrameHeader {
            frame_len,
            cell_id,
            length,
            record_type,
            timestamp,
        };
        buf[..FRAME_HEADER_SIZE].copy_from_slice(&header.encode());

        if let Err(e) = self.write_at(offset, &buf) {
            if relocated {
                let _ = self.file.set_len(prev_size);
            }
            return Err(e.into());
        }
        if relocated {
            self.size += u64::from(frame_len);
        }
        self.map.set(
            cell_id,
            Some(CellSlot {
                offset,
                frame_len,
                length,
            }),
        );

        Ok(CellWrite {
            offset: offset / BLOCK,
            relocated,
            bytes_written: buf.len() as u64,
            undo: CellUndo {
                cell_id,
                prev_slot,
                prev_size,
                overwritten,
            },
        })
    }

    /// Best-effort reversal of a [`write`](Self::write): restores the
    /// overwritten frame bytes or cuts the appended frame off again.
    pub fn rollback(&mut self, undo: CellUndo) -> Result<(), CellStoreError> {
        if let Some((offset, bytes)) = &undo.overwritten {
            self.write_at(*offset, bytes)?;
        }
        if self.size > undo.prev_size {
            self.file.set_len(undo.prev_size)?;
            self.size = undo.prev_size;
        }
        self.map.set(undo.cell_id, undo.prev_slot);
        Ok(())
    }

    /// Flushes file contents to disk.
    pub fn sync(&self) -> Result<(), CellStoreError> {
        self.file.sync_data()?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.flush()
    }
}

fn slot_capacity(slot: &CellSlot) -> usize {
    (slot.frame_len as usize).saturating_sub(FRAME_HEADER_SIZE) / BLOCK as usize
}

#[cfg(test)]
mod tests;
