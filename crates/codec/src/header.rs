//! Fixed-size block header and the running checksum.
//!
//! ```text
//! [checksum: u16 LE][record_type: u16 LE][record_size: u16 LE][time_advance: u16 LE]
//! ```
//!
//! `record_size` counts body granules of [`config::BLOCK_SIZE`] bytes.

use byteorder::{ByteOrder, LittleEndian};

/// Encoded size of a [`BlockHeader`] in bytes.
pub const HEADER_SIZE: usize = 8;

/// `record_type` reserved for time-advance sentinels.
pub const TIME_ADVANCE_TYPE: u16 = 0xFFFF;

/// Largest representable `record_size`, in granules.
pub const MAX_RECORD_GRANULES: u16 = 0xFFFF;

// A header must fill exactly one block so every record starts block-aligned.
const _: () = assert!(config::BLOCK_SIZE as usize == HEADER_SIZE);

/// Header preceding every record in the append log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    /// Running checksum as it stood *before* this record was applied.
    pub checksum: u16,
    pub record_type: u16,
    /// Body length in granules.
    pub record_size: u16,
    /// Low 16 bits of the timestamp delta (or the high 16 bits, for a
    /// time-advance sentinel).
    pub time_advance: u16,
}

impl BlockHeader {
    /// Builds the sentinel carrying the upper half of a large time delta.
    pub fn time_advance(checksum: u16, high: u16) -> Self {
        Self {
            checksum,
            record_type: TIME_ADVANCE_TYPE,
            record_size: 0,
            time_advance: high,
        }
    }

    /// Returns `true` for a time-advance sentinel (no payload, never
    /// surfaced to listeners).
    #[must_use]
    pub fn is_time_advance(&self) -> bool {
        self.record_type == TIME_ADVANCE_TYPE && self.record_size == 0
    }

    /// Body length in bytes.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.record_size as usize * config::BLOCK_SIZE as usize
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[0..2], self.checksum);
        LittleEndian::write_u16(&mut buf[2..4], self.record_type);
        LittleEndian::write_u16(&mut buf[4..6], self.record_size);
        LittleEndian::write_u16(&mut buf[6..8], self.time_advance);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            checksum: LittleEndian::read_u16(&buf[0..2]),
            record_type: LittleEndian::read_u16(&buf[2..4]),
            record_size: LittleEndian::read_u16(&buf[4..6]),
            time_advance: LittleEndian::read_u16(&buf[6..8]),
        }
    }
}

/// One step of the running checksum.
///
/// Both `sum ^ v` and the odd-constant multiply followed by a rotation are
/// bijections, so a change to any single input can never be cancelled by
/// later inputs.
#[inline]
#[must_use]
pub fn mix(sum: u16, v: u16) -> u16 {
    (sum ^ v).wrapping_mul(0x9E3B).rotate_left(7)
}

/// Folds one record into the running checksum: every body byte, then
/// `time_advance`, then `record_type`.
#[must_use]
pub fn accumulate(mut sum: u16, body: &[u8], time_advance: u16, record_type: u16) -> u16 {
    for &b in body {
        sum = mix(sum, u16::from(b));
    }
    sum = mix(sum, time_advance);
    mix(sum, record_type)
}

/// Writer-side chain state, updated in place by [`crate::write_block`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteState {
    pub checksum: u16,
    pub last_timestamp: u32,
}

/// Reader-side chain state threaded through [`crate::parse_block`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanState {
    pub checksum: u16,
    pub cur_time: u32,
}

impl From<ScanState> for WriteState {
    fn from(s: ScanState) -> Self {
        WriteState {
            checksum: s.checksum,
            last_timestamp: s.cur_time,
        }
    }
}

impl From<WriteState> for ScanState {
    fn from(s: WriteState) -> Self {
        ScanState {
            checksum: s.checksum,
            cur_time: s.last_timestamp,
        }
    }
}
