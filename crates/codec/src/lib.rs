//! # Codec - EventDB block format
//!
//! Serializes and parses the records of the append log.
//!
//! ## Record layout
//!
//! ```text
//! [checksum: u16][record_type: u16][record_size: u16][time_advance: u16]
//! [body: record_size granules of BLOCK_SIZE bytes]
//! ```
//!
//! The body is the payload followed by pseudo-random filler and a one-byte
//! filler count (see [`encode_body`]). All offsets handed to callers are
//! block indexes (`byte_offset / BLOCK_SIZE`).
//!
//! ## Checksum chain
//!
//! Each header carries the running checksum as it stood *before* its record.
//! The checksum then absorbs every body byte, `time_advance` and
//! `record_type`. A reader starting at offset 0 verifies every header; a
//! reader resuming mid-log adopts the first header's value instead.
//!
//! ## Timestamps
//!
//! Headers store a 16-bit forward delta. Larger deltas are preceded by a
//! time-advance sentinel (`record_type = 0xFFFF`, `record_size = 0`) holding
//! the upper 16 bits.
//!
//! ## Example
//!
//! ```rust
//! use codec::{write_block, BlockReader, ScanState, WriteState};
//! use rand::{rngs::SmallRng, SeedableRng};
//! use std::io::Cursor;
//!
//! let mut rng = SmallRng::seed_from_u64(7);
//! let mut state = WriteState::default();
//! let mut log = Vec::new();
//! write_block(&mut log, 0, 1, b"hello", 100, &mut state, &mut rng).unwrap();
//!
//! let len = log.len() as u64;
//! let mut r = BlockReader::new(Cursor::new(log), 0, len, ScanState::default(), false);
//! let rec = r.next_record().unwrap().unwrap();
//! assert_eq!(rec.payload, b"hello");
//! assert_eq!(rec.timestamp, 100);
//! ```

mod block;
mod body;
mod header;

pub use block::{
    parse_block, parse_body, read_header, validate_record, write_block, Appended, BlockReader,
    LogRecord,
};
pub use body::{body_granules, decode_body, encode_body, MAX_PAYLOAD};
pub use header::{
    accumulate, mix, BlockHeader, ScanState, WriteState, HEADER_SIZE, MAX_RECORD_GRANULES,
    TIME_ADVANCE_TYPE,
};

use std::io;
use thiserror::Error;

/// Errors raised while encoding or decoding blocks. Offsets are block indexes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The header's checksum disagrees with the locally accumulated one.
    #[error("checksum mismatch at block {offset}: expected {expected:#06x}, found {found:#06x}")]
    Checksum { expected: u16, found: u16, offset: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt block at {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The log ended in the middle of a block.
    #[error("unexpected end of log inside block {offset}")]
    UnexpectedEof { offset: u64 },
}
